#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context as _;
use dispatch_pubsub::EventBroker;
use dispatch_server::config::{default_config_path, load_server_config_from_path};
use dispatch_server::server::bridge::RealtimeBridge;
use dispatch_server::server::embedded::EmbeddedHub;
use dispatch_server::server::gate::{ConnectionGate, GateSettings};
use dispatch_server::server::http::{AppState, router};
use dispatch_server::server::hub::{HubConfig, RealtimeHub};
use dispatch_server::server::standalone::StandaloneHub;
use dispatch_util::endpoint::BindEndpoint;
use dispatch_util::telemetry::{init_metrics, init_tracing};
use tokio::sync::watch;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: dispatch_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.dispatch/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c");
		std::future::pending::<()>().await;
	}
	info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing("dispatch_server", "info,dispatch_server=debug");

	let config_path = match parse_args() {
		Some(path) => path,
		None => default_config_path()?,
	};
	let cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), mode = ?cfg.realtime.mode, "loaded server config (toml + env overrides)");

	init_metrics(cfg.realtime.metrics_bind.as_deref());

	let rt = &cfg.realtime;
	let broker = EventBroker::from_settings(&cfg.broker)?;
	let gate = ConnectionGate::new(GateSettings {
		secret_key: rt.secret_key.clone(),
		token_ttl: rt.token_ttl,
		allowed_origins: rt.allowed_origins.clone(),
	});
	if !gate.is_configured() {
		warn!("no realtime signing key configured; sockets will close with 1011 and tokens are unavailable");
	}
	let hub_cfg = HubConfig {
		client_queue_capacity: rt.client_queue_capacity,
		..HubConfig::default()
	};

	let http_bind = BindEndpoint::parse(&rt.http_bind).context("realtime.http_bind")?;
	let http_addr = http_bind.to_socket_addr_if_ip_literal()?;

	let embedded = rt.mode.runs_embedded().then(|| EmbeddedHub::start(hub_cfg.clone()));

	let standalone = if rt.mode.runs_standalone() {
		let ws_bind = BindEndpoint::new(rt.ws_host.clone(), rt.ws_port);
		let addr = ws_bind.to_socket_addr_if_ip_literal()?;
		Some(Arc::new(StandaloneHub::start(addr, gate.for_bind_host(&rt.ws_host), hub_cfg.clone())?))
	} else {
		None
	};

	let mut hubs: Vec<Arc<dyn RealtimeHub>> = Vec::new();
	if let Some(hub) = embedded.clone() {
		hubs.push(Arc::new(hub));
	}
	if let Some(hub) = standalone.clone() {
		hubs.push(hub);
	}

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let bridge = RealtimeBridge::new(broker, hubs);
	let listeners = bridge.spawn_listeners(&cfg.broker.all_channels(), &shutdown_rx);

	let state = AppState {
		gate: gate.for_bind_host(&http_bind.host),
		secret_key: rt.secret_key.clone(),
		token_ttl: rt.token_ttl,
		ws_port: rt.ws_port,
		disable_sameport: rt.disable_sameport,
		embedded: embedded.clone(),
		standalone: standalone.clone(),
		ready: Arc::new(AtomicBool::new(false)),
	};
	state.mark_ready();

	let listener = tokio::net::TcpListener::bind(http_addr)
		.await
		.with_context(|| format!("bind http on {http_addr}"))?;
	info!(%http_addr, "dispatch_server: http listening");

	axum::serve(listener, router(state))
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("http server")?;

	let _ = shutdown_tx.send(true);
	for handle in listeners {
		let _ = handle.await;
	}
	if let Some(hub) = embedded {
		hub.drain().await;
	}
	if let Some(hub) = standalone {
		tokio::task::spawn_blocking(move || hub.shutdown()).await?;
	}

	info!("dispatch_server stopped");
	Ok(())
}
