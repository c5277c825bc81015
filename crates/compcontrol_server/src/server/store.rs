#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;

/// Failure reaching or reading a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("corrupt row: {0}")]
	Corrupt(String),

	#[allow(dead_code)]
	#[error("store unavailable: {0}")]
	Unavailable(String),
}

/// Pool shared by the SQL key store and SQL connection registry.
#[derive(Clone, Debug)]
pub enum DatabasePool {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl DatabasePool {
	/// Connect and run embedded migrations. Supports `sqlite:` and `postgres:` URLs.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);

			// Each in-memory sqlite connection is its own database.
			let in_memory = database_url.contains(":memory:");
			let pool = SqlitePoolOptions::new()
				.max_connections(if in_memory { 1 } else { 8 })
				.idle_timeout(None)
				.max_lifetime(None)
				.connect_with(opts)
				.await
				.context("connect sqlite")?;

			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(8)
				.connect(database_url)
				.await
				.context("connect postgres")?;

			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self::Postgres(pool))
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match self {
			DatabasePool::Sqlite(_) => "sqlite",
			DatabasePool::Postgres(_) => "postgres",
		}
	}
}
