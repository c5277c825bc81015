#![forbid(unsafe_code)]

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::server::registry::ConnectionRegistry;
use crate::server::scheduler::{ScheduledJob, Scheduler, SchedulerError};
use crate::server::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleAction {
	Disabled,
	Enabled,
	Unchanged,
}

#[derive(Debug, Error)]
pub enum ToggleError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Scheduler(#[from] SchedulerError),
}

/// Turns the ping and warmer schedules off while the registry is empty.
///
/// Acts only at the 0 and 1 boundaries. A stale count is corrected by the next
/// tick.
#[derive(Clone)]
pub struct IdleToggler {
	registry: Arc<dyn ConnectionRegistry>,
	scheduler: Arc<dyn Scheduler>,
}

impl IdleToggler {
	pub fn new(registry: Arc<dyn ConnectionRegistry>, scheduler: Arc<dyn Scheduler>) -> Self {
		Self { registry, scheduler }
	}

	pub async fn check(&self) -> Result<ToggleAction, ToggleError> {
		let count = self.registry.count().await?;
		metrics::gauge!("compcontrol_registered_connections").set(count as f64);

		let enabled = match count {
			0 => false,
			1 => true,
			_ => {
				debug!(count, "toggle check: no change");
				return Ok(ToggleAction::Unchanged);
			}
		};

		for job in ScheduledJob::ALL {
			self.scheduler.set_enabled(job, enabled).await?;
		}

		info!(count, enabled, "toggle check applied");
		Ok(if enabled {
			ToggleAction::Enabled
		} else {
			ToggleAction::Disabled
		})
	}
}
