#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Transport-assigned connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
	/// Create a non-empty `ConnectionId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Random id for a freshly accepted socket.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ConnectionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConnectionId::new(s.to_string())
	}
}

/// Opaque bearer token issued by the key store.
///
/// Equality is exact byte equality; no trimming or case folding is applied to
/// the stored value. `Debug` and `Display` never print the token.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthKey(String);

impl AuthKey {
	/// Wrap a presented token. Blank tokens are rejected.
	pub fn new(token: impl Into<String>) -> Result<Self, ParseIdError> {
		let token = token.into();
		if token.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(token))
	}

	/// Parse an optional header value; absent or blank means no key.
	pub fn from_presented(token: Option<&str>) -> Option<Self> {
		token.and_then(|t| Self::new(t).ok())
	}

	/// Access the raw token.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for AuthKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("AuthKey(<redacted>)")
	}
}

impl fmt::Display for AuthKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Name of a command relayed to clients (e.g. `sleep`, `lock`).
///
/// Restricted to URL-unreserved characters (`A-Z a-z 0-9 - . _ ~`) so the
/// name arrives verbatim in a `/command/{command}` path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandName(String);

impl CommandName {
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !name.chars().all(is_unreserved) {
			return Err(ParseIdError::InvalidFormat(format!("command contains reserved characters: {name:?}")));
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

fn is_unreserved(c: char) -> bool {
	c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

impl fmt::Display for CommandName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for CommandName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		CommandName::new(s.to_string())
	}
}

/// Set of command names the dispatcher may relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
	commands: BTreeSet<CommandName>,
}

impl Whitelist {
	pub fn new(commands: impl IntoIterator<Item = CommandName>) -> Self {
		Self {
			commands: commands.into_iter().collect(),
		}
	}

	/// Build from raw strings, dropping blank or malformed entries.
	pub fn from_strs<I, S>(commands: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		Self::new(commands.into_iter().filter_map(|s| CommandName::new(s.as_ref().trim()).ok()))
	}

	/// Returns the whitelisted `CommandName` for a raw request, if allowed.
	pub fn resolve(&self, command: &str) -> Option<&CommandName> {
		self.commands.iter().find(|c| c.as_str() == command)
	}

	pub fn is_empty(&self) -> bool {
		self.commands.is_empty()
	}

	pub fn len(&self) -> usize {
		self.commands.len()
	}
}

/// Registry entry for a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
	pub connection_id: ConnectionId,
	pub associated_key: AuthKey,
	/// Unix time in milliseconds.
	pub created_at_ms: i64,
}

impl Connection {
	pub fn new(connection_id: ConnectionId, associated_key: AuthKey, created_at_ms: i64) -> Self {
		Self {
			connection_id,
			associated_key,
			created_at_ms,
		}
	}
}
