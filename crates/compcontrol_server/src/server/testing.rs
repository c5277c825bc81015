#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use compcontrol_domain::{AuthKey, Connection, ConnectionId, Whitelist};

use crate::server::dispatcher::{Dispatcher, DispatcherConfig};
use crate::server::gateway::{MessageGateway, PushError};
use crate::server::handler::EventHandler;
use crate::server::key_store::{InMemoryKeyStore, KeyStore};
use crate::server::lifecycle::ConnectionLifecycle;
use crate::server::pinger::Pinger;
use crate::server::registry::{ConnectionRegistry, InMemoryRegistry};
use crate::server::scheduler::{ScheduledJob, Scheduler, SchedulerError};
use crate::server::store::StoreError;
use crate::server::toggler::IdleToggler;

pub fn key(s: &str) -> AuthKey {
	AuthKey::new(s).expect("valid AuthKey")
}

pub fn conn(s: &str) -> ConnectionId {
	ConnectionId::new(s).expect("valid ConnectionId")
}

/// Records every push attempt. Chosen ids fail with a fixed error or never
/// complete.
#[derive(Default)]
pub struct RecordingGateway {
	attempts: Mutex<Vec<(ConnectionId, String)>>,
	failing: HashMap<ConnectionId, PushError>,
	stalled: HashSet<ConnectionId>,
}

impl RecordingGateway {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn failing(mut self, id: &str, err: PushError) -> Self {
		self.failing.insert(conn(id), err);
		self
	}

	pub fn stalled(mut self, id: &str) -> Self {
		self.stalled.insert(conn(id));
		self
	}

	pub fn attempts(&self) -> Vec<(ConnectionId, String)> {
		self.attempts.lock().expect("lock").clone()
	}

	/// Ids that received a payload, sorted.
	pub fn delivered_to(&self) -> Vec<ConnectionId> {
		let mut ids: Vec<_> = self
			.attempts()
			.into_iter()
			.map(|(id, _)| id)
			.filter(|id| !self.failing.contains_key(id) && !self.stalled.contains(id))
			.collect();
		ids.sort();
		ids
	}
}

#[async_trait]
impl MessageGateway for RecordingGateway {
	async fn push(&self, connection_id: &ConnectionId, payload: &str) -> Result<(), PushError> {
		self.attempts
			.lock()
			.expect("lock")
			.push((connection_id.clone(), payload.to_string()));

		if self.stalled.contains(connection_id) {
			std::future::pending::<()>().await;
		}
		match self.failing.get(connection_id) {
			Some(err) => Err(*err),
			None => Ok(()),
		}
	}
}

/// Key store whose backend is always down.
pub struct FailingKeyStore;

#[async_trait]
impl KeyStore for FailingKeyStore {
	async fn exists(&self, _key: &AuthKey) -> Result<bool, StoreError> {
		Err(StoreError::Unavailable("key store down".to_string()))
	}

	async fn insert(&self, _key: &AuthKey) -> Result<(), StoreError> {
		Err(StoreError::Unavailable("key store down".to_string()))
	}
}

/// In-memory registry that counts every call made through the trait.
#[derive(Default)]
pub struct CountingRegistry {
	inner: InMemoryRegistry,
	calls: AtomicUsize,
}

impl CountingRegistry {
	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	fn hit(&self) {
		self.calls.fetch_add(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl ConnectionRegistry for CountingRegistry {
	async fn upsert(&self, connection: Connection) -> Result<(), StoreError> {
		self.hit();
		self.inner.upsert(connection).await
	}

	async fn delete(&self, connection_id: &ConnectionId) -> Result<bool, StoreError> {
		self.hit();
		self.inner.delete(connection_id).await
	}

	async fn by_id(&self, connection_id: &ConnectionId) -> Result<Option<Connection>, StoreError> {
		self.hit();
		self.inner.by_id(connection_id).await
	}

	async fn by_key(&self, key: &AuthKey) -> Result<Vec<ConnectionId>, StoreError> {
		self.hit();
		self.inner.by_key(key).await
	}

	async fn count(&self) -> Result<u64, StoreError> {
		self.hit();
		self.inner.count().await
	}

	async fn all(&self) -> Result<Vec<ConnectionId>, StoreError> {
		self.hit();
		self.inner.all().await
	}
}

/// Registry whose backend is always down.
pub struct FailingRegistry;

#[async_trait]
impl ConnectionRegistry for FailingRegistry {
	async fn upsert(&self, _connection: Connection) -> Result<(), StoreError> {
		Err(StoreError::Unavailable("registry down".to_string()))
	}

	async fn delete(&self, _connection_id: &ConnectionId) -> Result<bool, StoreError> {
		Err(StoreError::Unavailable("registry down".to_string()))
	}

	async fn by_id(&self, _connection_id: &ConnectionId) -> Result<Option<Connection>, StoreError> {
		Err(StoreError::Unavailable("registry down".to_string()))
	}

	async fn by_key(&self, _key: &AuthKey) -> Result<Vec<ConnectionId>, StoreError> {
		Err(StoreError::Unavailable("registry down".to_string()))
	}

	async fn count(&self) -> Result<u64, StoreError> {
		Err(StoreError::Unavailable("registry down".to_string()))
	}

	async fn all(&self) -> Result<Vec<ConnectionId>, StoreError> {
		Err(StoreError::Unavailable("registry down".to_string()))
	}
}

/// Scheduler that records every enable/disable call.
#[derive(Default)]
pub struct RecordingScheduler {
	calls: Mutex<Vec<(ScheduledJob, bool)>>,
	fail: bool,
}

impl RecordingScheduler {
	pub fn failing() -> Self {
		Self {
			calls: Mutex::default(),
			fail: true,
		}
	}

	pub fn calls(&self) -> Vec<(ScheduledJob, bool)> {
		self.calls.lock().expect("lock").clone()
	}
}

#[async_trait]
impl Scheduler for RecordingScheduler {
	async fn set_enabled(&self, job: ScheduledJob, enabled: bool) -> Result<(), SchedulerError> {
		if self.fail {
			return Err(SchedulerError::Unavailable("scheduler down".to_string()));
		}
		self.calls.lock().expect("lock").push((job, enabled));
		Ok(())
	}

	fn is_enabled(&self, job: ScheduledJob) -> bool {
		self.calls
			.lock()
			.expect("lock")
			.iter()
			.rev()
			.find(|(j, _)| *j == job)
			.is_some_and(|(_, enabled)| *enabled)
	}
}

/// Event handler wired to in-memory fakes.
pub struct Harness {
	pub keys: Arc<InMemoryKeyStore>,
	pub registry: Arc<CountingRegistry>,
	pub gateway: Arc<RecordingGateway>,
	pub scheduler: Arc<RecordingScheduler>,
	pub handler: EventHandler,
}

pub fn harness(commands: &[&str], cfg: DispatcherConfig, gateway: RecordingGateway) -> Harness {
	let keys = Arc::new(InMemoryKeyStore::new());
	let registry = Arc::new(CountingRegistry::default());
	let gateway = Arc::new(gateway);
	let scheduler = Arc::new(RecordingScheduler::default());

	let push_timeout = cfg.push_timeout;
	let dispatcher = Dispatcher::new(
		Whitelist::from_strs(commands),
		keys.clone(),
		registry.clone(),
		gateway.clone(),
		cfg,
	);
	let handler = EventHandler::new(
		ConnectionLifecycle::new(registry.clone()),
		dispatcher,
		Pinger::new(registry.clone(), gateway.clone(), push_timeout),
		IdleToggler::new(registry.clone(), scheduler.clone()),
	);

	Harness {
		keys,
		registry,
		gateway,
		scheduler,
		handler,
	}
}
