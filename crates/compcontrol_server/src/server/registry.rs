#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use compcontrol_domain::{AuthKey, Connection, ConnectionId};
use tokio::sync::RwLock;

use crate::server::store::{DatabasePool, StoreError};

/// Directory of live connections keyed by connection id, with a secondary
/// index by associated key.
///
/// `all` is a full scan. That is fine for the dozens to hundreds of
/// connections this server targets; larger deployments would page through it.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
	/// Insert or overwrite the entry for `connection.connection_id`.
	async fn upsert(&self, connection: Connection) -> Result<(), StoreError>;

	/// Unconditional delete. Returns whether an entry existed.
	async fn delete(&self, connection_id: &ConnectionId) -> Result<bool, StoreError>;

	async fn by_id(&self, connection_id: &ConnectionId) -> Result<Option<Connection>, StoreError>;

	/// Connection ids associated with `key`, sorted.
	async fn by_key(&self, key: &AuthKey) -> Result<Vec<ConnectionId>, StoreError>;

	async fn count(&self) -> Result<u64, StoreError>;

	/// Every registered connection id, sorted.
	async fn all(&self) -> Result<Vec<ConnectionId>, StoreError>;
}

/// Map-of-maps registry. Both indexes live under one lock.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
	inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	by_id: HashMap<ConnectionId, Connection>,
	by_key: HashMap<AuthKey, BTreeSet<ConnectionId>>,
}

impl Inner {
	fn unindex(&mut self, key: &AuthKey, connection_id: &ConnectionId) {
		if let Some(ids) = self.by_key.get_mut(key) {
			ids.remove(connection_id);
			if ids.is_empty() {
				self.by_key.remove(key);
			}
		}
	}
}

impl InMemoryRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// True when the key index and the primary map describe the same entries.
	#[cfg(test)]
	pub async fn index_is_consistent(&self) -> bool {
		let inner = self.inner.read().await;
		let indexed: usize = inner.by_key.values().map(BTreeSet::len).sum();
		if indexed != inner.by_id.len() {
			return false;
		}

		inner.by_key.iter().all(|(key, ids)| {
			!ids.is_empty()
				&& ids
					.iter()
					.all(|id| inner.by_id.get(id).is_some_and(|c| &c.associated_key == key))
		})
	}
}

#[async_trait]
impl ConnectionRegistry for InMemoryRegistry {
	async fn upsert(&self, connection: Connection) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		let id = connection.connection_id.clone();
		let key = connection.associated_key.clone();

		if let Some(prev) = inner.by_id.insert(id.clone(), connection)
			&& prev.associated_key != key
		{
			inner.unindex(&prev.associated_key, &id);
		}

		inner.by_key.entry(key).or_default().insert(id);
		Ok(())
	}

	async fn delete(&self, connection_id: &ConnectionId) -> Result<bool, StoreError> {
		let mut inner = self.inner.write().await;
		let Some(prev) = inner.by_id.remove(connection_id) else {
			return Ok(false);
		};

		inner.unindex(&prev.associated_key, connection_id);
		Ok(true)
	}

	async fn by_id(&self, connection_id: &ConnectionId) -> Result<Option<Connection>, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner.by_id.get(connection_id).cloned())
	}

	async fn by_key(&self, key: &AuthKey) -> Result<Vec<ConnectionId>, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner
			.by_key
			.get(key)
			.map(|ids| ids.iter().cloned().collect())
			.unwrap_or_default())
	}

	async fn count(&self) -> Result<u64, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner.by_id.len() as u64)
	}

	async fn all(&self) -> Result<Vec<ConnectionId>, StoreError> {
		let inner = self.inner.read().await;
		let mut ids = inner.by_id.keys().cloned().collect::<Vec<_>>();
		ids.sort();
		Ok(ids)
	}
}

/// Registry persisted in the `connections` table. The key index is a plain
/// SQL index, so it cannot drift from the primary rows.
#[derive(Clone, Debug)]
pub struct SqlRegistry {
	pool: DatabasePool,
}

impl SqlRegistry {
	pub fn new(pool: DatabasePool) -> Self {
		Self { pool }
	}

	/// Delete every row. Returns how many were removed.
	pub async fn clear(&self) -> Result<u64, StoreError> {
		let affected = match &self.pool {
			DatabasePool::Sqlite(pool) => sqlx::query("DELETE FROM connections").execute(pool).await?.rows_affected(),
			DatabasePool::Postgres(pool) => sqlx::query("DELETE FROM connections").execute(pool).await?.rows_affected(),
		};
		Ok(affected)
	}
}

fn connection_from_row((connection_id, associated_key, created_at_ms): (String, String, i64)) -> Result<Connection, StoreError> {
	let connection_id =
		ConnectionId::new(connection_id).map_err(|e| StoreError::Corrupt(format!("connection_id: {e}")))?;
	let associated_key = AuthKey::new(associated_key).map_err(|e| StoreError::Corrupt(format!("associated_key: {e}")))?;
	Ok(Connection::new(connection_id, associated_key, created_at_ms))
}

fn ids_from_rows(rows: Vec<(String,)>) -> Result<Vec<ConnectionId>, StoreError> {
	rows.into_iter()
		.map(|(id,)| ConnectionId::new(id).map_err(|e| StoreError::Corrupt(format!("connection_id: {e}"))))
		.collect()
}

#[async_trait]
impl ConnectionRegistry for SqlRegistry {
	async fn upsert(&self, connection: Connection) -> Result<(), StoreError> {
		match &self.pool {
			DatabasePool::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO connections (connection_id, associated_key, created_at_ms) VALUES (?, ?, ?) \
					ON CONFLICT(connection_id) DO UPDATE SET associated_key = excluded.associated_key, created_at_ms = excluded.created_at_ms",
				)
				.bind(connection.connection_id.as_str())
				.bind(connection.associated_key.expose())
				.bind(connection.created_at_ms)
				.execute(pool)
				.await?;
			}
			DatabasePool::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO connections (connection_id, associated_key, created_at_ms) VALUES ($1, $2, $3) \
					ON CONFLICT (connection_id) DO UPDATE SET associated_key = EXCLUDED.associated_key, created_at_ms = EXCLUDED.created_at_ms",
				)
				.bind(connection.connection_id.as_str())
				.bind(connection.associated_key.expose())
				.bind(connection.created_at_ms)
				.execute(pool)
				.await?;
			}
		}
		Ok(())
	}

	async fn delete(&self, connection_id: &ConnectionId) -> Result<bool, StoreError> {
		let affected = match &self.pool {
			DatabasePool::Sqlite(pool) => sqlx::query("DELETE FROM connections WHERE connection_id = ?")
				.bind(connection_id.as_str())
				.execute(pool)
				.await?
				.rows_affected(),
			DatabasePool::Postgres(pool) => sqlx::query("DELETE FROM connections WHERE connection_id = $1")
				.bind(connection_id.as_str())
				.execute(pool)
				.await?
				.rows_affected(),
		};
		Ok(affected > 0)
	}

	async fn by_id(&self, connection_id: &ConnectionId) -> Result<Option<Connection>, StoreError> {
		let row: Option<(String, String, i64)> = match &self.pool {
			DatabasePool::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT connection_id, associated_key, created_at_ms FROM connections WHERE connection_id = ?",
				)
				.bind(connection_id.as_str())
				.fetch_optional(pool)
				.await?
			}
			DatabasePool::Postgres(pool) => {
				sqlx::query_as(
					"SELECT connection_id, associated_key, created_at_ms FROM connections WHERE connection_id = $1",
				)
				.bind(connection_id.as_str())
				.fetch_optional(pool)
				.await?
			}
		};

		row.map(connection_from_row).transpose()
	}

	async fn by_key(&self, key: &AuthKey) -> Result<Vec<ConnectionId>, StoreError> {
		let rows: Vec<(String,)> = match &self.pool {
			DatabasePool::Sqlite(pool) => {
				sqlx::query_as("SELECT connection_id FROM connections WHERE associated_key = ? ORDER BY connection_id")
					.bind(key.expose())
					.fetch_all(pool)
					.await?
			}
			DatabasePool::Postgres(pool) => {
				sqlx::query_as("SELECT connection_id FROM connections WHERE associated_key = $1 ORDER BY connection_id")
					.bind(key.expose())
					.fetch_all(pool)
					.await?
			}
		};

		ids_from_rows(rows)
	}

	async fn count(&self) -> Result<u64, StoreError> {
		let (count,): (i64,) = match &self.pool {
			DatabasePool::Sqlite(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM connections")
					.fetch_one(pool)
					.await?
			}
			DatabasePool::Postgres(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM connections")
					.fetch_one(pool)
					.await?
			}
		};
		Ok(count.max(0) as u64)
	}

	async fn all(&self) -> Result<Vec<ConnectionId>, StoreError> {
		let rows: Vec<(String,)> = match &self.pool {
			DatabasePool::Sqlite(pool) => {
				sqlx::query_as("SELECT connection_id FROM connections ORDER BY connection_id")
					.fetch_all(pool)
					.await?
			}
			DatabasePool::Postgres(pool) => {
				sqlx::query_as("SELECT connection_id FROM connections ORDER BY connection_id")
					.fetch_all(pool)
					.await?
			}
		};

		ids_from_rows(rows)
	}
}
