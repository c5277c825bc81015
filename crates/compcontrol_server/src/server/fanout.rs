#![forbid(unsafe_code)]

use std::time::Duration;

use compcontrol_domain::ConnectionId;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::warn;

use crate::server::gateway::{MessageGateway, PushError};

/// Outcome of pushing one payload to a set of connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
	pub attempted: usize,
	pub failures: Vec<(ConnectionId, PushError)>,
}

impl FanOutReport {
	pub fn delivered(&self) -> usize {
		self.attempted.saturating_sub(self.failures.len())
	}

	/// Targets the gateway reported as permanently gone.
	pub fn gone(&self) -> impl Iterator<Item = &ConnectionId> {
		self.failures
			.iter()
			.filter(|(_, e)| *e == PushError::Gone)
			.map(|(id, _)| id)
	}
}

/// Push `payload` to every target concurrently. Each push is bounded by
/// `push_timeout`; a timeout counts as a failed push. Failures never stop the
/// remaining pushes.
pub async fn fan_out(
	gateway: &dyn MessageGateway,
	targets: &[ConnectionId],
	payload: &str,
	push_timeout: Duration,
) -> FanOutReport {
	let pushes = targets.iter().map(|id| async move {
		let res = match timeout(push_timeout, gateway.push(id, payload)).await {
			Ok(res) => res,
			Err(_) => Err(PushError::Timeout),
		};
		(id, res)
	});

	let mut report = FanOutReport {
		attempted: targets.len(),
		failures: Vec::new(),
	};

	for (id, res) in join_all(pushes).await {
		if let Err(e) = res {
			warn!(conn_id = %id, error = %e, "push failed");
			metrics::counter!("compcontrol_push_failures_total", "kind" => e.as_str()).increment(1);
			report.failures.push((id.clone(), e));
		}
	}

	report
}
