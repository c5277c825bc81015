#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use compcontrol_protocol::InboundEvent;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::server::handler::EventHandler;

/// Periodic jobs whose enablement the idle toggler controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledJob {
	Ping,
	Warmer,
}

impl ScheduledJob {
	pub const ALL: [ScheduledJob; 2] = [ScheduledJob::Ping, ScheduledJob::Warmer];

	pub const fn as_str(self) -> &'static str {
		match self {
			ScheduledJob::Ping => "ping",
			ScheduledJob::Warmer => "warmer",
		}
	}
}

impl fmt::Display for ScheduledJob {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Error)]
pub enum SchedulerError {
	#[allow(dead_code)]
	#[error("scheduler unavailable: {0}")]
	Unavailable(String),
}

/// Enable/disable switch for periodic jobs.
#[async_trait]
pub trait Scheduler: Send + Sync {
	async fn set_enabled(&self, job: ScheduledJob, enabled: bool) -> Result<(), SchedulerError>;

	fn is_enabled(&self, job: ScheduledJob) -> bool;
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
	pub ping_interval: Duration,
	pub warmer_interval: Duration,
	pub toggle_interval: Duration,
}

impl Default for ScheduleConfig {
	fn default() -> Self {
		Self {
			ping_interval: Duration::from_secs(60),
			warmer_interval: Duration::from_secs(300),
			toggle_interval: Duration::from_secs(60),
		}
	}
}

/// In-process scheduler driven by tokio intervals. Ping and warmer ticks are
/// only delivered while their job is enabled; toggle checks always run.
#[derive(Debug, Clone, Default)]
pub struct IntervalScheduler {
	ping_enabled: Arc<AtomicBool>,
	warmer_enabled: Arc<AtomicBool>,
}

impl IntervalScheduler {
	/// Both jobs start disabled; the first toggle check turns them on.
	pub fn new() -> Self {
		Self::default()
	}

	fn flag(&self, job: ScheduledJob) -> &Arc<AtomicBool> {
		match job {
			ScheduledJob::Ping => &self.ping_enabled,
			ScheduledJob::Warmer => &self.warmer_enabled,
		}
	}

	/// Spawn the three tick loops. They exit once `shutdown` flips to `true`.
	pub fn spawn(
		&self,
		cfg: &ScheduleConfig,
		handler: Arc<EventHandler>,
		shutdown: watch::Receiver<bool>,
	) -> Vec<JoinHandle<()>> {
		vec![
			spawn_tick_loop(
				cfg.ping_interval,
				Some(Arc::clone(&self.ping_enabled)),
				InboundEvent::ScheduledPing,
				Arc::clone(&handler),
				shutdown.clone(),
			),
			spawn_tick_loop(
				cfg.warmer_interval,
				Some(Arc::clone(&self.warmer_enabled)),
				InboundEvent::ScheduledWarmer,
				Arc::clone(&handler),
				shutdown.clone(),
			),
			spawn_tick_loop(
				cfg.toggle_interval,
				None,
				InboundEvent::ScheduledToggleCheck,
				handler,
				shutdown,
			),
		]
	}
}

#[async_trait]
impl Scheduler for IntervalScheduler {
	async fn set_enabled(&self, job: ScheduledJob, enabled: bool) -> Result<(), SchedulerError> {
		let prev = self.flag(job).swap(enabled, Ordering::Relaxed);
		if prev != enabled {
			info!(%job, enabled, "schedule toggled");
		}
		Ok(())
	}

	fn is_enabled(&self, job: ScheduledJob) -> bool {
		self.flag(job).load(Ordering::Relaxed)
	}
}

fn spawn_tick_loop(
	period: Duration,
	gate: Option<Arc<AtomicBool>>,
	event: InboundEvent,
	handler: Arc<EventHandler>,
	mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// The first tick completes immediately.
		ticker.tick().await;

		loop {
			tokio::select! {
				_ = ticker.tick() => {
					if gate.as_ref().is_some_and(|g| !g.load(Ordering::Relaxed)) {
						continue;
					}
					let resp = handler.handle(event.clone()).await;
					debug!(event = event.kind(), status = resp.status, "scheduled tick handled");
				}
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						debug!(event = event.kind(), "tick loop stopping");
						break;
					}
				}
			}
		}
	})
}
