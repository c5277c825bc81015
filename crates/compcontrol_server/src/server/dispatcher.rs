#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use compcontrol_domain::{AuthKey, Whitelist};
use compcontrol_protocol::{DispatchOutcome, PushPayload};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::server::fanout::{FanOutReport, fan_out};
use crate::server::gateway::MessageGateway;
use crate::server::key_store::KeyStore;
use crate::server::registry::ConnectionRegistry;

/// How dispatch targets are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
	/// Connections registered under the presented key.
	#[default]
	Targeted,
	/// Every registered connection; no key resolution.
	Broadcast,
}

impl FromStr for DispatchMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"targeted" | "key" => Ok(DispatchMode::Targeted),
			"broadcast" | "all" => Ok(DispatchMode::Broadcast),
			other => Err(format!("unknown dispatch mode: {other} (expected targeted|broadcast)")),
		}
	}
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	pub mode: DispatchMode,
	pub push_timeout: Duration,
	/// Remove targets the gateway reports as gone. Off by default.
	pub evict_gone_connections: bool,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			mode: DispatchMode::Targeted,
			push_timeout: Duration::from_secs(3),
			evict_gone_connections: false,
		}
	}
}

/// Input accepted by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub enum DispatchInput<'a> {
	/// Scheduled keep-warm tick. Touches nothing.
	Warmer,
	Request {
		command: &'a str,
		presented_key: Option<&'a AuthKey>,
	},
}

/// Validates, authorizes, and fans out whitelisted commands.
#[derive(Clone)]
pub struct Dispatcher {
	whitelist: Whitelist,
	keys: Arc<dyn KeyStore>,
	registry: Arc<dyn ConnectionRegistry>,
	gateway: Arc<dyn MessageGateway>,
	cfg: DispatcherConfig,
}

impl Dispatcher {
	pub fn new(
		whitelist: Whitelist,
		keys: Arc<dyn KeyStore>,
		registry: Arc<dyn ConnectionRegistry>,
		gateway: Arc<dyn MessageGateway>,
		cfg: DispatcherConfig,
	) -> Self {
		Self {
			whitelist,
			keys,
			registry,
			gateway,
			cfg,
		}
	}

	#[allow(dead_code)]
	pub fn mode(&self) -> DispatchMode {
		self.cfg.mode
	}

	pub async fn handle(&self, input: DispatchInput<'_>) -> DispatchOutcome {
		let outcome = match input {
			DispatchInput::Warmer => {
				debug!("dispatch: warmer tick");
				DispatchOutcome::Warmed
			}
			DispatchInput::Request { command, presented_key } => self.dispatch(command, presented_key).await,
		};

		metrics::counter!("compcontrol_dispatch_total", "outcome" => outcome.as_str()).increment(1);
		outcome
	}

	async fn dispatch(&self, command: &str, presented_key: Option<&AuthKey>) -> DispatchOutcome {
		// Whitelist first: rejected commands never reveal anything about the key.
		let Some(command) = self.whitelist.resolve(command) else {
			info!(command, "dispatch rejected: command not whitelisted");
			return DispatchOutcome::CommandNotAllowed;
		};

		let targets = match self.cfg.mode {
			DispatchMode::Targeted => {
				let Some(key) = presented_key else {
					info!(%command, "dispatch rejected: missing token");
					return DispatchOutcome::MissingToken;
				};

				match self.keys.exists(key).await {
					Ok(true) => {}
					Ok(false) => {
						info!(%command, "dispatch rejected: invalid token");
						return DispatchOutcome::InvalidToken;
					}
					Err(e) => {
						error!(%command, error = %e, "dispatch failed: key store unavailable");
						return DispatchOutcome::StoreUnavailable;
					}
				}

				match self.registry.by_key(key).await {
					Ok(targets) if targets.is_empty() => {
						info!(%command, "dispatch: no connected clients for key");
						return DispatchOutcome::NoTargets;
					}
					Ok(targets) => targets,
					Err(e) => {
						error!(%command, error = %e, "dispatch failed: registry unavailable");
						return DispatchOutcome::StoreUnavailable;
					}
				}
			}
			DispatchMode::Broadcast => match self.registry.all().await {
				Ok(targets) => targets,
				Err(e) => {
					error!(%command, error = %e, "broadcast failed: registry unavailable");
					return DispatchOutcome::StoreUnavailable;
				}
			},
		};

		let payload = match PushPayload::command(command).to_json() {
			Ok(payload) => payload,
			Err(e) => {
				error!(%command, error = %e, "dispatch failed: payload encode");
				return DispatchOutcome::StoreUnavailable;
			}
		};

		let report = fan_out(self.gateway.as_ref(), &targets, &payload, self.cfg.push_timeout).await;
		info!(
			%command,
			targets = report.attempted,
			delivered = report.delivered(),
			failed = report.failures.len(),
			"dispatch fan-out complete"
		);

		if self.cfg.evict_gone_connections {
			self.evict_gone(&report).await;
		}

		DispatchOutcome::Success
	}

	async fn evict_gone(&self, report: &FanOutReport) {
		for id in report.gone() {
			match self.registry.delete(id).await {
				Ok(true) => info!(conn_id = %id, "evicted gone connection"),
				Ok(false) => {}
				Err(e) => warn!(conn_id = %id, error = %e, "failed to evict gone connection"),
			}
		}
	}
}
