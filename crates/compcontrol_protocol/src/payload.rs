#![forbid(unsafe_code)]

use compcontrol_domain::CommandName;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Top-level `type` of a payload pushed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
	Command,
	Nop,
}

/// Message pushed to a connected client, e.g. `{"type":"command","subtype":"lock"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
	#[serde(rename = "type")]
	pub kind: PayloadKind,
	pub subtype: String,
}

impl PushPayload {
	pub const PING_SUBTYPE: &'static str = "ping";

	pub fn command(command: &CommandName) -> Self {
		Self {
			kind: PayloadKind::Command,
			subtype: command.as_str().to_string(),
		}
	}

	pub fn ping() -> Self {
		Self {
			kind: PayloadKind::Nop,
			subtype: Self::PING_SUBTYPE.to_string(),
		}
	}

	/// Encode as the JSON text frame sent over the socket.
	pub fn to_json(&self) -> Result<String, ProtocolError> {
		Ok(serde_json::to_string(self)?)
	}
}
