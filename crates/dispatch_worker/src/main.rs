#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use dispatch_pubsub::{EventBroker, LeaseStore, RedisLeaseStore};
use dispatch_util::telemetry::{init_metrics, init_tracing};
use dispatch_worker::config::{default_config_path, load_worker_config_from_path};
use dispatch_worker::health::{HealthState, spawn_health_server};
use dispatch_worker::lock::{SchedulerLock, process_owner};
use dispatch_worker::runner::TickRunner;
use dispatch_worker::tasks::alerts::AlertEvaluation;
use dispatch_worker::tasks::duty::DutyBookkeeping;
use dispatch_worker::tasks::retention::RetentionSweep;
use dispatch_worker::tasks::{self, TaskContext};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Exit status telling the supervisor that leadership was lost.
const EXIT_LEADERSHIP_LOST: u8 = 2;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: dispatch_worker [--config path]\n\
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

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
	init_tracing("dispatch_worker", "info,dispatch_worker=debug");

	let config_path = match parse_args() {
		Some(path) => path,
		None => default_config_path()?,
	};
	let cfg = load_worker_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded worker config (toml + env overrides)");
	let sc = &cfg.scheduler;

	init_metrics(sc.metrics_bind.as_deref());

	let database_url = sc
		.database_url
		.as_ref()
		.ok_or_else(|| anyhow!("scheduler.database_url (DATABASE_URL) is required"))?;
	let pool = tasks::connect(database_url.expose(), 4).await?;
	let broker = EventBroker::from_settings(&cfg.broker)?;

	let store: Option<Arc<dyn LeaseStore>> = match cfg.broker.redis_url.as_ref() {
		Some(url) => Some(Arc::new(RedisLeaseStore::open(url.expose())?)),
		None => None,
	};
	let lock = Arc::new(SchedulerLock::new(store, sc, process_owner()));

	let health = HealthState::new();
	if let Some(bind) = sc.health_bind.as_deref() {
		let addr: SocketAddr = bind.parse().with_context(|| format!("invalid health bind {bind}"))?;
		spawn_health_server(addr, health.clone()).await?;
	}

	let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => info!("shutdown requested"),
			Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
		}
		let _ = shutdown_tx.send(true);
	});

	info!(
		key = %lock.key(),
		owner = %lock.owner(),
		ttl = ?lock.ttl(),
		guarded = lock.is_guarded(),
		"waiting for scheduler lock"
	);
	if !lock.acquire(&mut shutdown_rx).await {
		info!("shutdown before acquiring scheduler lock");
		return Ok(ExitCode::SUCCESS);
	}
	health.set_leading(true);

	let ctx = TaskContext::new(pool, broker);
	let runner = TickRunner::new(lock.clone())
		.with_task(Arc::new(DutyBookkeeping::new(ctx.clone(), sc.duty_interval)))
		.with_task(Arc::new(AlertEvaluation::new(ctx.clone(), sc.alerts_interval, sc.thresholds)))
		.with_task(Arc::new(RetentionSweep::new(ctx, sc.retention_interval, sc.retention)));

	match runner.run(shutdown_rx).await {
		Ok(()) => {
			health.set_leading(false);
			lock.release().await;
			info!("dispatch_worker stopped");
			Ok(ExitCode::SUCCESS)
		}
		Err(lost) => {
			health.set_leading(false);
			error!(error = %lost, "exiting so a supervisor can restart the worker");
			Ok(ExitCode::from(EXIT_LEADERSHIP_LOST))
		}
	}
}
