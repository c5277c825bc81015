#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use compcontrol_domain::{AuthKey, ParseIdError};
use rand::RngCore;
use tokio::sync::RwLock;
use tracing::info;

use crate::server::store::{DatabasePool, StoreError};

/// Random bytes per issued key, before base64 encoding.
pub const KEY_ENTROPY_BYTES: usize = 64;

/// Store of issued opaque keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
	async fn exists(&self, key: &AuthKey) -> Result<bool, StoreError>;

	async fn insert(&self, key: &AuthKey) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
	keys: RwLock<HashSet<AuthKey>>,
}

impl InMemoryKeyStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_keys(keys: impl IntoIterator<Item = AuthKey>) -> Self {
		Self {
			keys: RwLock::new(keys.into_iter().collect()),
		}
	}
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
	async fn exists(&self, key: &AuthKey) -> Result<bool, StoreError> {
		Ok(self.keys.read().await.contains(key))
	}

	async fn insert(&self, key: &AuthKey) -> Result<(), StoreError> {
		self.keys.write().await.insert(key.clone());
		Ok(())
	}
}

/// Keys persisted in the `auth_keys` table.
#[derive(Clone, Debug)]
pub struct SqlKeyStore {
	pool: DatabasePool,
}

impl SqlKeyStore {
	pub fn new(pool: DatabasePool) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl KeyStore for SqlKeyStore {
	async fn exists(&self, key: &AuthKey) -> Result<bool, StoreError> {
		let row: Option<(i64,)> = match &self.pool {
			DatabasePool::Sqlite(pool) => {
				sqlx::query_as("SELECT 1 FROM auth_keys WHERE auth_key = ?")
					.bind(key.expose())
					.fetch_optional(pool)
					.await?
			}
			DatabasePool::Postgres(pool) => {
				sqlx::query_as("SELECT 1::BIGINT FROM auth_keys WHERE auth_key = $1")
					.bind(key.expose())
					.fetch_optional(pool)
					.await?
			}
		};
		Ok(row.is_some())
	}

	async fn insert(&self, key: &AuthKey) -> Result<(), StoreError> {
		let now_ms = chrono::Utc::now().timestamp_millis();
		match &self.pool {
			DatabasePool::Sqlite(pool) => {
				sqlx::query("INSERT INTO auth_keys (auth_key, created_at_ms) VALUES (?, ?) ON CONFLICT(auth_key) DO NOTHING")
					.bind(key.expose())
					.bind(now_ms)
					.execute(pool)
					.await?;
			}
			DatabasePool::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO auth_keys (auth_key, created_at_ms) VALUES ($1, $2) ON CONFLICT (auth_key) DO NOTHING",
				)
				.bind(key.expose())
				.bind(now_ms)
				.execute(pool)
				.await?;
			}
		}
		Ok(())
	}
}

/// Generate a URL-safe token from `KEY_ENTROPY_BYTES` random bytes.
pub fn generate_key() -> Result<AuthKey, ParseIdError> {
	let mut bytes = [0u8; KEY_ENTROPY_BYTES];
	rand::rng().fill_bytes(&mut bytes);
	AuthKey::new(URL_SAFE_NO_PAD.encode(bytes))
}

/// Issues new keys and records them before handing them out.
#[derive(Clone)]
pub struct KeyIssuer {
	keys: Arc<dyn KeyStore>,
}

impl KeyIssuer {
	pub fn new(keys: Arc<dyn KeyStore>) -> Self {
		Self { keys }
	}

	pub async fn issue(&self) -> Result<AuthKey, StoreError> {
		let key = generate_key().map_err(|e| StoreError::Corrupt(format!("generated key: {e}")))?;
		self.keys.insert(&key).await?;
		metrics::counter!("compcontrol_keys_issued_total").increment(1);
		info!("issued new auth key");
		Ok(key)
	}
}
