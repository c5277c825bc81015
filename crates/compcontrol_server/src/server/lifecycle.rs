#![forbid(unsafe_code)]

use std::sync::Arc;

use compcontrol_domain::{AuthKey, Connection, ConnectionId};
use thiserror::Error;
use tracing::{debug, info};

use crate::server::registry::ConnectionRegistry;
use crate::server::store::StoreError;

#[derive(Debug, Error)]
pub enum LifecycleError {
	/// A connect carried no key. Such an entry could never be targeted by a
	/// keyed dispatch, so it is refused instead of stored.
	#[error("connect event carried no auth key")]
	MissingKey,

	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Keeps the registry in step with transport connect/disconnect events.
#[derive(Clone)]
pub struct ConnectionLifecycle {
	registry: Arc<dyn ConnectionRegistry>,
}

impl ConnectionLifecycle {
	pub fn new(registry: Arc<dyn ConnectionRegistry>) -> Self {
		Self { registry }
	}

	/// Upsert; reconnecting with the same id overwrites the entry.
	pub async fn on_connect(&self, connection_id: ConnectionId, presented: Option<AuthKey>) -> Result<(), LifecycleError> {
		let Some(key) = presented else {
			return Err(LifecycleError::MissingKey);
		};

		let now_ms = chrono::Utc::now().timestamp_millis();
		self.registry
			.upsert(Connection::new(connection_id.clone(), key, now_ms))
			.await?;

		metrics::counter!("compcontrol_connections_total").increment(1);
		info!(conn_id = %connection_id, "connection registered");
		Ok(())
	}

	/// Unconditional delete. Unknown ids are a no-op.
	pub async fn on_disconnect(&self, connection_id: &ConnectionId) -> Result<(), LifecycleError> {
		if self.registry.delete(connection_id).await? {
			info!(conn_id = %connection_id, "connection removed");
		} else {
			debug!(conn_id = %connection_id, "disconnect for unknown connection ignored");
		}
		Ok(())
	}
}
