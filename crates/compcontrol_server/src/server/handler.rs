#![forbid(unsafe_code)]

use compcontrol_protocol::{DispatchOutcome, InboundEvent, MessageBody};
use tracing::{error, warn};

use crate::server::dispatcher::{DispatchInput, Dispatcher};
use crate::server::lifecycle::{ConnectionLifecycle, LifecycleError};
use crate::server::pinger::Pinger;
use crate::server::toggler::IdleToggler;

/// Status plus optional JSON body for one handled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResponse {
	pub status: u16,
	pub body: Option<MessageBody>,
}

impl EventResponse {
	pub fn status_only(status: u16) -> Self {
		Self { status, body: None }
	}

	pub fn with_message(status: u16, message: impl Into<String>) -> Self {
		Self {
			status,
			body: Some(MessageBody::new(message)),
		}
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}
}

impl From<DispatchOutcome> for EventResponse {
	fn from(outcome: DispatchOutcome) -> Self {
		Self {
			status: outcome.status_code(),
			body: Some(outcome.body()),
		}
	}
}

/// Routes each inbound event to the component that owns it.
pub struct EventHandler {
	lifecycle: ConnectionLifecycle,
	dispatcher: Dispatcher,
	pinger: Pinger,
	toggler: IdleToggler,
}

impl EventHandler {
	pub fn new(lifecycle: ConnectionLifecycle, dispatcher: Dispatcher, pinger: Pinger, toggler: IdleToggler) -> Self {
		Self {
			lifecycle,
			dispatcher,
			pinger,
			toggler,
		}
	}

	pub async fn handle(&self, event: InboundEvent) -> EventResponse {
		match event {
			InboundEvent::ClientConnect {
				connection_id,
				presented_token,
			} => match self.lifecycle.on_connect(connection_id, presented_token).await {
				Ok(()) => EventResponse::status_only(200),
				Err(LifecycleError::MissingKey) => {
					warn!("connect rejected: no auth key");
					EventResponse::status_only(403)
				}
				Err(LifecycleError::Store(e)) => {
					error!(error = %e, "connect failed: registry unavailable");
					EventResponse::status_only(500)
				}
			},
			InboundEvent::ClientDisconnect { connection_id } => match self.lifecycle.on_disconnect(&connection_id).await {
				Ok(()) => EventResponse::status_only(200),
				Err(e) => {
					error!(conn_id = %connection_id, error = %e, "disconnect failed");
					EventResponse::status_only(500)
				}
			},
			InboundEvent::DispatchRequest { command, presented_key } => self
				.dispatcher
				.handle(DispatchInput::Request {
					command: &command,
					presented_key: presented_key.as_ref(),
				})
				.await
				.into(),
			InboundEvent::ScheduledWarmer => self.dispatcher.handle(DispatchInput::Warmer).await.into(),
			InboundEvent::ScheduledPing => {
				self.pinger.ping_all().await;
				EventResponse::with_message(200, "Success")
			}
			InboundEvent::ScheduledToggleCheck => match self.toggler.check().await {
				Ok(_) => EventResponse::status_only(200),
				Err(e) => {
					warn!(error = %e, "toggle check failed");
					EventResponse::status_only(500)
				}
			},
		}
	}
}
