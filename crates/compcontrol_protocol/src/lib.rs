#![forbid(unsafe_code)]

pub mod event;
pub mod payload;
pub mod response;

pub use event::InboundEvent;
pub use payload::{PayloadKind, PushPayload};
pub use response::{DispatchOutcome, KeyIssuedBody, MessageBody};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("json encode error: {0}")]
	Encode(#[from] serde_json::Error),
}
