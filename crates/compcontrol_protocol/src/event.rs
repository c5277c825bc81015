#![forbid(unsafe_code)]

use compcontrol_domain::{AuthKey, ConnectionId};

/// Every event the server reacts to, tagged once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
	ClientConnect {
		connection_id: ConnectionId,
		presented_token: Option<AuthKey>,
	},
	ClientDisconnect {
		connection_id: ConnectionId,
	},
	DispatchRequest {
		/// Raw path segment; validated against the whitelist by the dispatcher.
		command: String,
		presented_key: Option<AuthKey>,
	},
	ScheduledWarmer,
	ScheduledPing,
	ScheduledToggleCheck,
}

impl InboundEvent {
	/// Stable label for logs/metrics.
	pub const fn kind(&self) -> &'static str {
		match self {
			InboundEvent::ClientConnect { .. } => "client_connect",
			InboundEvent::ClientDisconnect { .. } => "client_disconnect",
			InboundEvent::DispatchRequest { .. } => "dispatch_request",
			InboundEvent::ScheduledWarmer => "scheduled_warmer",
			InboundEvent::ScheduledPing => "scheduled_ping",
			InboundEvent::ScheduledToggleCheck => "scheduled_toggle_check",
		}
	}
}
