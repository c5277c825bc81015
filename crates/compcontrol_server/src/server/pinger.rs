#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use compcontrol_protocol::PushPayload;
use tracing::{debug, warn};

use crate::server::fanout::{FanOutReport, fan_out};
use crate::server::gateway::MessageGateway;
use crate::server::registry::ConnectionRegistry;

/// Pushes a no-op ping to every registered connection.
#[derive(Clone)]
pub struct Pinger {
	registry: Arc<dyn ConnectionRegistry>,
	gateway: Arc<dyn MessageGateway>,
	push_timeout: Duration,
}

impl Pinger {
	pub fn new(registry: Arc<dyn ConnectionRegistry>, gateway: Arc<dyn MessageGateway>, push_timeout: Duration) -> Self {
		Self {
			registry,
			gateway,
			push_timeout,
		}
	}

	/// Always succeeds; failed pushes and a failed enumeration are only logged.
	/// Failed entries stay registered until their disconnect arrives.
	pub async fn ping_all(&self) -> FanOutReport {
		let targets = match self.registry.all().await {
			Ok(targets) => targets,
			Err(e) => {
				warn!(error = %e, "ping skipped: registry unavailable");
				return FanOutReport::default();
			}
		};

		let payload = match PushPayload::ping().to_json() {
			Ok(payload) => payload,
			Err(e) => {
				warn!(error = %e, "ping skipped: payload encode");
				return FanOutReport::default();
			}
		};

		let report = fan_out(self.gateway.as_ref(), &targets, &payload, self.push_timeout).await;
		metrics::counter!("compcontrol_pings_total").increment(report.delivered() as u64);
		debug!(
			targets = report.attempted,
			failed = report.failures.len(),
			"keepalive ping complete"
		);
		report
	}
}
