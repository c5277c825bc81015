#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// JSON body returned by the dispatch endpoint: `{"message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
	pub message: String,
}

impl MessageBody {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
		}
	}
}

/// JSON body returned by key issuance: `{"key": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIssuedBody {
	pub key: String,
}

/// Result of handling a dispatch request or warmer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchOutcome {
	/// Every resolved target was attempted.
	Success,
	/// Scheduled warmer short-circuit.
	Warmed,
	CommandNotAllowed,
	MissingToken,
	InvalidToken,
	/// Key is valid but has no live connections.
	NoTargets,
	/// Registry or key store could not be reached.
	StoreUnavailable,
}

impl DispatchOutcome {
	pub const fn status_code(self) -> u16 {
		match self {
			DispatchOutcome::Success | DispatchOutcome::Warmed => 200,
			DispatchOutcome::CommandNotAllowed | DispatchOutcome::MissingToken | DispatchOutcome::InvalidToken => 403,
			DispatchOutcome::NoTargets => 404,
			DispatchOutcome::StoreUnavailable => 500,
		}
	}

	pub const fn message(self) -> &'static str {
		match self {
			DispatchOutcome::Success => "Success!",
			DispatchOutcome::Warmed => "OK (Warmer path)",
			DispatchOutcome::CommandNotAllowed => "Command not whitelisted",
			DispatchOutcome::MissingToken => "Missing authentication token",
			DispatchOutcome::InvalidToken => "Invalid authentication token",
			DispatchOutcome::NoTargets => "No connected clients to send command to",
			DispatchOutcome::StoreUnavailable => "Internal server error",
		}
	}

	/// Stable label for metrics.
	pub const fn as_str(self) -> &'static str {
		match self {
			DispatchOutcome::Success => "success",
			DispatchOutcome::Warmed => "warmed",
			DispatchOutcome::CommandNotAllowed => "command_not_allowed",
			DispatchOutcome::MissingToken => "missing_token",
			DispatchOutcome::InvalidToken => "invalid_token",
			DispatchOutcome::NoTargets => "no_targets",
			DispatchOutcome::StoreUnavailable => "store_unavailable",
		}
	}

	pub fn body(self) -> MessageBody {
		MessageBody::new(self.message())
	}
}
