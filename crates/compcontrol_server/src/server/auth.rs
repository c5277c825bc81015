#![forbid(unsafe_code)]

use std::sync::Arc;

use compcontrol_domain::AuthKey;
use tracing::{debug, warn};

use crate::server::key_store::KeyStore;

/// Decision for a gated resource (e.g. the websocket upgrade path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
	Allow(String),
	Deny(String),
}

impl AuthDecision {
	pub fn is_allow(&self) -> bool {
		matches!(self, AuthDecision::Allow(_))
	}

	#[allow(dead_code)]
	pub fn resource(&self) -> &str {
		match self {
			AuthDecision::Allow(r) | AuthDecision::Deny(r) => r,
		}
	}
}

/// Allows a resource only for keys present in the key store.
#[derive(Clone)]
pub struct Authorizer {
	keys: Arc<dyn KeyStore>,
}

impl Authorizer {
	pub fn new(keys: Arc<dyn KeyStore>) -> Self {
		Self { keys }
	}

	/// Missing tokens deny. Key store failures deny (fail closed).
	pub async fn authorize(&self, resource: &str, presented: Option<&AuthKey>) -> AuthDecision {
		let Some(key) = presented else {
			debug!(resource, "auth denied: no token presented");
			metrics::counter!("compcontrol_auth_denied_total", "reason" => "missing").increment(1);
			return AuthDecision::Deny(resource.to_string());
		};

		match self.keys.exists(key).await {
			Ok(true) => AuthDecision::Allow(resource.to_string()),
			Ok(false) => {
				debug!(resource, "auth denied: unknown token");
				metrics::counter!("compcontrol_auth_denied_total", "reason" => "unknown").increment(1);
				AuthDecision::Deny(resource.to_string())
			}
			Err(e) => {
				warn!(resource, error = %e, "auth denied: key store unavailable");
				metrics::counter!("compcontrol_auth_denied_total", "reason" => "store_unavailable").increment(1);
				AuthDecision::Deny(resource.to_string())
			}
		}
	}
}
