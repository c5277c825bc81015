#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::app::{Stores, build_app};
use crate::server::http::serve;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: compcontrol_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind address (default: 127.0.0.1:18280)\n\
\t--config   Config file (default: ~/.compcontrol/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct CliArgs {
	bind: Option<SocketAddr>,
	config: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let addr = v.trim().parse::<SocketAddr>().unwrap_or_else(|e| {
					eprintln!("--bind: {e} (expected host:port)");
					usage_and_exit();
				});
				args.bind = Some(addr);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,compcontrol_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("compcontrol_server");
				global::set_tracer_provider(tracer_provider);

				base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(
		path = %config_path.display(),
		commands = server_cfg.dispatch.allowed_commands.len(),
		mode = ?server_cfg.dispatch.dispatcher.mode,
		"loaded server config (toml + env overrides)"
	);

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let bind_addr = match args.bind {
		Some(addr) => addr,
		None => server_cfg
			.server
			.bind
			.parse::<SocketAddr>()
			.with_context(|| format!("invalid server.bind {:?}", server_cfg.server.bind))?,
	};

	let stores = Stores::from_settings(&server_cfg.persistence).await?;
	let app = build_app(&server_cfg, stores);

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let ticks = app
		.scheduler
		.spawn(&server_cfg.schedule, app.handler.clone(), shutdown_rx.clone());

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, ws_path = %app.state.ws_path, "compcontrol_server listening");

	let health = app.state.health.clone();
	health.mark_ready();

	let server_task = tokio::spawn(serve(listener, app.state, shutdown_rx));

	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c");
	}
	info!("shutdown requested");
	health.mark_not_ready();
	let _ = shutdown_tx.send(true);

	match server_task.await {
		Ok(res) => res?,
		Err(e) => warn!(error = %e, "server task panicked"),
	}
	for tick in ticks {
		let _ = tick.await;
	}

	Ok(())
}
