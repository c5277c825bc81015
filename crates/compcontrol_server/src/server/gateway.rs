#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use compcontrol_domain::ConnectionId;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// Why a single push did not reach its connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushError {
	/// The transport no longer knows the connection.
	#[error("connection is gone")]
	Gone,

	#[error("push timed out")]
	Timeout,

	#[error("outbound queue full")]
	QueueFull,
}

impl PushError {
	pub const fn as_str(self) -> &'static str {
		match self {
			PushError::Gone => "gone",
			PushError::Timeout => "timeout",
			PushError::QueueFull => "queue_full",
		}
	}
}

/// Transport that can push a text payload to one connection.
#[async_trait]
pub trait MessageGateway: Send + Sync {
	async fn push(&self, connection_id: &ConnectionId, payload: &str) -> Result<(), PushError>;
}

/// In-process gateway: one bounded outbound queue per live websocket, drained
/// by that socket's writer task.
#[derive(Debug, Clone)]
pub struct LocalGateway {
	outbound: Arc<RwLock<HashMap<ConnectionId, mpsc::Sender<String>>>>,
	queue_capacity: usize,
}

impl LocalGateway {
	pub fn new(queue_capacity: usize) -> Self {
		Self {
			outbound: Arc::new(RwLock::new(HashMap::new())),
			queue_capacity: queue_capacity.max(1),
		}
	}

	/// Register a socket and return the receiver its writer drains.
	pub async fn attach(&self, connection_id: ConnectionId) -> mpsc::Receiver<String> {
		let (tx, rx) = mpsc::channel(self.queue_capacity);
		let mut outbound = self.outbound.write().await;
		outbound.retain(|_, tx| !tx.is_closed());
		outbound.insert(connection_id, tx);
		rx
	}

	pub async fn detach(&self, connection_id: &ConnectionId) {
		self.outbound.write().await.remove(connection_id);
	}

	pub async fn live_connections(&self) -> usize {
		self.outbound.read().await.values().filter(|tx| !tx.is_closed()).count()
	}
}

#[async_trait]
impl MessageGateway for LocalGateway {
	async fn push(&self, connection_id: &ConnectionId, payload: &str) -> Result<(), PushError> {
		let Some(tx) = self.outbound.read().await.get(connection_id).cloned() else {
			return Err(PushError::Gone);
		};

		match tx.try_send(payload.to_string()) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => {
				debug!(conn_id = %connection_id, "gateway: outbound queue full");
				Err(PushError::QueueFull)
			}
			Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Gone),
		}
	}
}
