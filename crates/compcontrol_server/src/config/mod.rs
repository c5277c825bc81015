#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use compcontrol_domain::{CommandName, Whitelist};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::dispatcher::{DispatchMode, DispatcherConfig};
use crate::server::scheduler::ScheduleConfig;

pub const DEFAULT_BIND: &str = "127.0.0.1:18280";
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Default config path: `~/.compcontrol/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".compcontrol").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |name| std::env::var(name).ok());

	if cfg.dispatch.allowed_commands.is_empty() {
		warn!("dispatch config: allowed_commands is empty; every command will be rejected");
	}

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub dispatch: DispatchSettings,
	pub gateway: GatewaySettings,
	pub schedule: ScheduleConfig,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP/WebSocket bind address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Path clients upgrade on.
	pub ws_path: String,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			metrics_bind: None,
			ws_path: DEFAULT_WS_PATH.to_string(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct DispatchSettings {
	pub allowed_commands: Whitelist,
	pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
	/// Per-socket outbound queue depth.
	pub outbound_queue_capacity: usize,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	dispatch: FileDispatchSettings,

	#[serde(default)]
	gateway: FileGatewaySettings,

	#[serde(default)]
	schedule: FileScheduleSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	ws_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDispatchSettings {
	#[serde(default)]
	allowed_commands: Vec<String>,
	mode: Option<DispatchMode>,
	push_timeout_ms: Option<u64>,
	evict_gone_connections: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileGatewaySettings {
	outbound_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileScheduleSettings {
	ping_interval_secs: Option<u64>,
	warmer_interval_secs: Option<u64>,
	toggle_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let allowed_commands = strict_whitelist(file.dispatch.allowed_commands.iter().map(String::as_str))
			.context("dispatch.allowed_commands")?;

		let dispatcher_defaults = DispatcherConfig::default();
		let schedule_defaults = ScheduleConfig::default();

		Ok(Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_BIND.to_string()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				ws_path: file
					.server
					.ws_path
					.filter(|s| s.starts_with('/'))
					.unwrap_or_else(|| DEFAULT_WS_PATH.to_string()),
			},
			dispatch: DispatchSettings {
				allowed_commands,
				dispatcher: DispatcherConfig {
					mode: file.dispatch.mode.unwrap_or_default(),
					push_timeout: file
						.dispatch
						.push_timeout_ms
						.filter(|v| *v > 0)
						.map(Duration::from_millis)
						.unwrap_or(dispatcher_defaults.push_timeout),
					evict_gone_connections: file
						.dispatch
						.evict_gone_connections
						.unwrap_or(dispatcher_defaults.evict_gone_connections),
				},
			},
			gateway: GatewaySettings {
				outbound_queue_capacity: file
					.gateway
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY),
			},
			schedule: ScheduleConfig {
				ping_interval: secs_or(file.schedule.ping_interval_secs, schedule_defaults.ping_interval),
				warmer_interval: secs_or(file.schedule.warmer_interval_secs, schedule_defaults.warmer_interval),
				toggle_interval: secs_or(file.schedule.toggle_interval_secs, schedule_defaults.toggle_interval),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		})
	}
}

fn secs_or(v: Option<u64>, default: Duration) -> Duration {
	v.filter(|v| *v > 0).map(Duration::from_secs).unwrap_or(default)
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

/// Parse an allowed-commands override. Accepts a JSON object (values are the
/// commands), a JSON array, or a comma-separated list.
pub fn parse_allowed_commands(raw: &str) -> anyhow::Result<Whitelist> {
	let raw = raw.trim();
	let names: Vec<String> = if raw.starts_with('{') {
		let map: serde_json::Map<String, serde_json::Value> =
			serde_json::from_str(raw).context("parse allowed commands as JSON object")?;
		map.into_iter()
			.map(|(k, v)| match v {
				serde_json::Value::String(s) => Ok(s),
				other => Err(anyhow!("allowed command {k:?} must be a string, got {other}")),
			})
			.collect::<anyhow::Result<_>>()?
	} else if raw.starts_with('[') {
		serde_json::from_str(raw).context("parse allowed commands as JSON array")?
	} else {
		raw.split(',').map(|s| s.trim().to_string()).collect()
	};

	strict_whitelist(names.iter().map(String::as_str))
}

/// Blank entries are skipped; malformed ones are an error.
fn strict_whitelist<'a>(names: impl IntoIterator<Item = &'a str>) -> anyhow::Result<Whitelist> {
	let commands = names
		.into_iter()
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(|s| CommandName::new(s).with_context(|| format!("invalid allowed command {s:?}")))
		.collect::<anyhow::Result<Vec<_>>>()?;
	Ok(Whitelist::new(commands))
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env("COMPCONTROL_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = v;
			info!("server config: bind overridden by env");
		}
	}

	if let Some(v) = env("COMPCONTROL_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Some(v) = env("COMPCONTROL_ALLOWED_COMMANDS") {
		match parse_allowed_commands(&v) {
			Ok(list) => {
				info!(count = list.len(), "dispatch config: allowed_commands overridden by env");
				cfg.dispatch.allowed_commands = list;
			}
			Err(e) => warn!(error = %e, "ignoring invalid COMPCONTROL_ALLOWED_COMMANDS"),
		}
	}

	if let Some(v) = env("COMPCONTROL_DISPATCH_MODE") {
		match v.parse::<DispatchMode>() {
			Ok(mode) => {
				cfg.dispatch.dispatcher.mode = mode;
				info!(?mode, "dispatch config: mode overridden by env");
			}
			Err(e) => warn!(error = %e, "ignoring invalid COMPCONTROL_DISPATCH_MODE"),
		}
	}

	if let Some(v) = env("COMPCONTROL_PUSH_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
		&& ms > 0
	{
		cfg.dispatch.dispatcher.push_timeout = Duration::from_millis(ms);
		info!(ms, "dispatch config: push_timeout overridden by env");
	}

	if let Some(v) = env("COMPCONTROL_EVICT_GONE_CONNECTIONS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.dispatch.dispatcher.evict_gone_connections = enabled;
		info!(enabled, "dispatch config: evict_gone_connections overridden by env");
	}

	if let Some(v) = env("COMPCONTROL_PING_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.schedule.ping_interval = Duration::from_secs(secs);
		info!(secs, "schedule config: ping_interval overridden by env");
	}

	if let Some(v) = env("COMPCONTROL_WARMER_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.schedule.warmer_interval = Duration::from_secs(secs);
		info!(secs, "schedule config: warmer_interval overridden by env");
	}

	if let Some(v) = env("COMPCONTROL_TOGGLE_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.schedule.toggle_interval = Duration::from_secs(secs);
		info!(secs, "schedule config: toggle_interval overridden by env");
	}

	if let Some(v) = env("COMPCONTROL_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence config: enabled overridden by env");
	}

	if let Some(v) = env("COMPCONTROL_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence config: database_url overridden by env");
		}
	}
}
