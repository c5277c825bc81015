#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use tracing::info;

use crate::config::{PersistenceSettings, ServerConfig};
use crate::server::auth::Authorizer;
use crate::server::dispatcher::Dispatcher;
use crate::server::gateway::{LocalGateway, MessageGateway};
use crate::server::handler::EventHandler;
use crate::server::health::HealthState;
use crate::server::http::AppState;
use crate::server::key_store::{InMemoryKeyStore, KeyIssuer, KeyStore, SqlKeyStore};
use crate::server::lifecycle::ConnectionLifecycle;
use crate::server::pinger::Pinger;
use crate::server::registry::{ConnectionRegistry, InMemoryRegistry, SqlRegistry};
use crate::server::scheduler::IntervalScheduler;
use crate::server::store::DatabasePool;
use crate::server::toggler::IdleToggler;

/// Key store and registry backing one server instance.
#[derive(Clone)]
pub struct Stores {
	pub keys: Arc<dyn KeyStore>,
	pub registry: Arc<dyn ConnectionRegistry>,
}

impl Stores {
	pub fn in_memory() -> Self {
		Self {
			keys: Arc::new(InMemoryKeyStore::new()),
			registry: Arc::new(InMemoryRegistry::new()),
		}
	}

	/// SQL-backed stores when persistence is enabled, in-memory otherwise.
	pub async fn from_settings(persistence: &PersistenceSettings) -> anyhow::Result<Self> {
		if !persistence.enabled {
			info!("persistence disabled: using in-memory key store and registry");
			return Ok(Self::in_memory());
		}

		let Some(database_url) = persistence.database_url.as_deref() else {
			return Err(anyhow!("persistence enabled but no database_url configured"));
		};

		let pool = DatabasePool::connect(database_url).await?;

		// Sockets live in this process's gateway only; rows left by an earlier
		// process can never receive a disconnect.
		let registry = SqlRegistry::new(pool.clone());
		let stale = registry.clear().await.context("clear stale connections")?;
		info!(backend = pool.backend_name(), stale, "persistence enabled");

		Ok(Self {
			keys: Arc::new(SqlKeyStore::new(pool)),
			registry: Arc::new(registry),
		})
	}
}

/// Fully wired server components.
pub struct App {
	pub state: AppState,
	pub handler: Arc<EventHandler>,
	pub scheduler: IntervalScheduler,
}

pub fn build_app(cfg: &ServerConfig, stores: Stores) -> App {
	let gateway = LocalGateway::new(cfg.gateway.outbound_queue_capacity);
	let gateway_handle: Arc<dyn MessageGateway> = Arc::new(gateway.clone());
	let scheduler = IntervalScheduler::new();

	let dispatcher = Dispatcher::new(
		cfg.dispatch.allowed_commands.clone(),
		Arc::clone(&stores.keys),
		Arc::clone(&stores.registry),
		Arc::clone(&gateway_handle),
		cfg.dispatch.dispatcher.clone(),
	);
	let pinger = Pinger::new(
		Arc::clone(&stores.registry),
		gateway_handle,
		cfg.dispatch.dispatcher.push_timeout,
	);
	let toggler = IdleToggler::new(Arc::clone(&stores.registry), Arc::new(scheduler.clone()));
	let lifecycle = ConnectionLifecycle::new(Arc::clone(&stores.registry));

	let handler = Arc::new(EventHandler::new(lifecycle, dispatcher, pinger, toggler));

	let state = AppState {
		handler: Arc::clone(&handler),
		authorizer: Authorizer::new(Arc::clone(&stores.keys)),
		issuer: KeyIssuer::new(stores.keys),
		gateway,
		health: HealthState::new(),
		ws_path: cfg.server.ws_path.clone(),
	};

	App {
		state,
		handler,
		scheduler,
	}
}
