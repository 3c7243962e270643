#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use dispatch_domain::SecretString;
use dispatch_pubsub::{BrokerSettings, FileBrokerSettings};
use dispatch_util::env::{non_empty, process_env};
use serde::Deserialize;
use tracing::info;

pub const DEFAULT_LOCK_KEY: &str = "dispatch:schedulers:lock";

const MIN_DUTY_INTERVAL_SECS: u64 = 5;
const MIN_ALERTS_INTERVAL_SECS: u64 = 3;
const MIN_RETENTION_DAYS: u64 = 7;

/// Shortest accepted lease: two periods of the 5s renewal floor.
pub const MIN_LOCK_TTL_SECS: u64 = 10;

/// Default config path: `~/.dispatch/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".dispatch").join("config.toml"))
}

/// Load the worker config from TOML and process env overrides.
pub fn load_worker_config_from_path(path: &Path) -> anyhow::Result<WorkerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = WorkerConfig::from_file(file_cfg);
	cfg.apply_env_overrides(&process_env);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
	pub broker: BrokerSettings,
	pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
	pub database_url: Option<SecretString>,
	pub lock_key: String,
	pub lock_ttl: Duration,
	pub acquire_backoff: Duration,
	pub duty_interval: Duration,
	pub alerts_interval: Duration,
	pub retention_interval: Duration,
	pub thresholds: AlertThresholds,
	pub retention: RetentionPolicy,
	pub health_bind: Option<String>,
	pub metrics_bind: Option<String>,
}

impl Default for SchedulerSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			lock_key: DEFAULT_LOCK_KEY.to_string(),
			lock_ttl: Duration::from_secs(60),
			acquire_backoff: Duration::from_secs(5),
			duty_interval: Duration::from_secs(30),
			alerts_interval: Duration::from_secs(10),
			retention_interval: Duration::from_secs(24 * 3600),
			thresholds: AlertThresholds::default(),
			retention: RetentionPolicy::default(),
			health_bind: None,
			metrics_bind: None,
		}
	}
}

/// Limits the alert evaluation compares device state against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertThresholds {
	pub stale_points_secs: i64,
	pub stale_health_secs: i64,
	pub queue_warn: i64,
	pub queue_crit: i64,
	pub battery_low: i64,
	pub battery_crit: i64,
	pub accuracy_warn_m: i64,
	pub accuracy_crit_m: i64,
}

impl Default for AlertThresholds {
	fn default() -> Self {
		Self {
			stale_points_secs: 300,
			stale_health_secs: 180,
			queue_warn: 50,
			queue_crit: 150,
			battery_low: 15,
			battery_crit: 7,
			accuracy_warn_m: 50,
			accuracy_crit_m: 120,
		}
	}
}

/// Row ages (in days) past which the retention sweep deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
	pub points_days: u64,
	pub health_log_days: u64,
}

impl Default for RetentionPolicy {
	fn default() -> Self {
		Self {
			points_days: 90,
			health_log_days: 30,
		}
	}
}

impl RetentionPolicy {
	/// Never below a week.
	pub fn effective_points_days(&self) -> u64 {
		self.points_days.max(MIN_RETENTION_DAYS)
	}

	pub fn effective_health_log_days(&self) -> u64 {
		self.health_log_days.max(MIN_RETENTION_DAYS)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	broker: FileBrokerSettings,

	#[serde(default)]
	scheduler: FileSchedulerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSchedulerSettings {
	database_url: Option<String>,
	lock_key: Option<String>,
	lock_ttl_secs: Option<u64>,
	acquire_backoff_secs: Option<u64>,
	duty_interval_secs: Option<u64>,
	alerts_interval_secs: Option<u64>,
	retention_interval_secs: Option<u64>,
	stale_points_secs: Option<i64>,
	stale_health_secs: Option<i64>,
	queue_warn: Option<i64>,
	queue_crit: Option<i64>,
	battery_low: Option<i64>,
	battery_crit: Option<i64>,
	accuracy_warn_m: Option<i64>,
	accuracy_crit_m: Option<i64>,
	retention_points_days: Option<u64>,
	retention_health_log_days: Option<u64>,
	health_bind: Option<String>,
	metrics_bind: Option<String>,
}

fn secs_at_least(v: u64, min: u64) -> Duration {
	Duration::from_secs(v.max(min))
}

impl WorkerConfig {
	fn from_file(file: FileConfig) -> Self {
		let d = SchedulerSettings::default();
		let s = file.scheduler;

		Self {
			broker: BrokerSettings::from_file(file.broker),
			scheduler: SchedulerSettings {
				database_url: non_empty(s.database_url).map(SecretString::new),
				lock_key: non_empty(s.lock_key).unwrap_or(d.lock_key),
				lock_ttl: s
					.lock_ttl_secs
					.map(|v| secs_at_least(v, MIN_LOCK_TTL_SECS))
					.unwrap_or(d.lock_ttl),
				acquire_backoff: s
					.acquire_backoff_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(d.acquire_backoff),
				duty_interval: s
					.duty_interval_secs
					.map(|v| secs_at_least(v, MIN_DUTY_INTERVAL_SECS))
					.unwrap_or(d.duty_interval),
				alerts_interval: s
					.alerts_interval_secs
					.map(|v| secs_at_least(v, MIN_ALERTS_INTERVAL_SECS))
					.unwrap_or(d.alerts_interval),
				retention_interval: s
					.retention_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(d.retention_interval),
				thresholds: AlertThresholds {
					stale_points_secs: s.stale_points_secs.unwrap_or(d.thresholds.stale_points_secs),
					stale_health_secs: s.stale_health_secs.unwrap_or(d.thresholds.stale_health_secs),
					queue_warn: s.queue_warn.unwrap_or(d.thresholds.queue_warn),
					queue_crit: s.queue_crit.unwrap_or(d.thresholds.queue_crit),
					battery_low: s.battery_low.unwrap_or(d.thresholds.battery_low),
					battery_crit: s.battery_crit.unwrap_or(d.thresholds.battery_crit),
					accuracy_warn_m: s.accuracy_warn_m.unwrap_or(d.thresholds.accuracy_warn_m),
					accuracy_crit_m: s.accuracy_crit_m.unwrap_or(d.thresholds.accuracy_crit_m),
				},
				retention: RetentionPolicy {
					points_days: s.retention_points_days.unwrap_or(d.retention.points_days),
					health_log_days: s.retention_health_log_days.unwrap_or(d.retention.health_log_days),
				},
				health_bind: non_empty(s.health_bind),
				metrics_bind: non_empty(s.metrics_bind),
			},
		}
	}

	pub fn apply_env_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
		self.broker.apply_env_overrides(lookup);
		let sc = &mut self.scheduler;

		let num = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
		let int = |key: &str| lookup(key).and_then(|v| v.trim().parse::<i64>().ok());

		if let Some(v) = non_empty(lookup("DATABASE_URL")) {
			sc.database_url = Some(SecretString::new(v));
			info!("scheduler config: database_url overridden by env");
		}

		if let Some(v) = non_empty(lookup("SCHEDULER_LOCK_KEY")) {
			info!(key = %v, "scheduler config: lock_key overridden by env");
			sc.lock_key = v;
		}

		if let Some(secs) = num("SCHEDULER_LOCK_TTL_SEC") {
			sc.lock_ttl = secs_at_least(secs, MIN_LOCK_TTL_SECS);
			info!(secs = sc.lock_ttl.as_secs(), "scheduler config: lock_ttl overridden by env");
		}

		if let Some(secs) = num("SCHEDULER_LOCK_BACKOFF_SEC").filter(|v| *v > 0) {
			sc.acquire_backoff = Duration::from_secs(secs);
			info!(secs, "scheduler config: acquire_backoff overridden by env");
		}

		if let Some(secs) = num("DUTY_SCHEDULER_INTERVAL_SEC") {
			sc.duty_interval = secs_at_least(secs, MIN_DUTY_INTERVAL_SECS);
			info!(secs = sc.duty_interval.as_secs(), "scheduler config: duty_interval overridden by env");
		}

		if let Some(secs) = num("TRACKER_ALERTS_INTERVAL_SEC") {
			sc.alerts_interval = secs_at_least(secs, MIN_ALERTS_INTERVAL_SECS);
			info!(
				secs = sc.alerts_interval.as_secs(),
				"scheduler config: alerts_interval overridden by env"
			);
		}

		if let Some(secs) = num("RETENTION_INTERVAL_SEC").filter(|v| *v > 0) {
			sc.retention_interval = Duration::from_secs(secs);
			info!(secs, "scheduler config: retention_interval overridden by env");
		}

		if let Some(v) = int("TRACKER_STALE_POINTS_SEC") {
			sc.thresholds.stale_points_secs = v;
			info!(v, "scheduler config: stale_points_secs overridden by env");
		}
		if let Some(v) = int("TRACKER_STALE_HEALTH_SEC") {
			sc.thresholds.stale_health_secs = v;
			info!(v, "scheduler config: stale_health_secs overridden by env");
		}
		if let Some(v) = int("TRACKER_QUEUE_WARN") {
			sc.thresholds.queue_warn = v;
			info!(v, "scheduler config: queue_warn overridden by env");
		}
		if let Some(v) = int("TRACKER_QUEUE_CRIT") {
			sc.thresholds.queue_crit = v;
			info!(v, "scheduler config: queue_crit overridden by env");
		}
		if let Some(v) = int("TRACKER_ACCURACY_WARN_M") {
			sc.thresholds.accuracy_warn_m = v;
			info!(v, "scheduler config: accuracy_warn_m overridden by env");
		}
		if let Some(v) = int("TRACKER_ACCURACY_CRIT_M") {
			sc.thresholds.accuracy_crit_m = v;
			info!(v, "scheduler config: accuracy_crit_m overridden by env");
		}
		if let Some(v) = int("TRACKER_BATTERY_LOW") {
			sc.thresholds.battery_low = v;
			info!(v, "scheduler config: battery_low overridden by env");
		}
		if let Some(v) = int("TRACKER_BATTERY_CRIT") {
			sc.thresholds.battery_crit = v;
			info!(v, "scheduler config: battery_crit overridden by env");
		}

		if let Some(v) = num("TRACKER_RETENTION_POINTS_DAYS") {
			sc.retention.points_days = v;
			info!(v, "scheduler config: retention_points_days overridden by env");
		}
		if let Some(v) = num("TRACKER_RETENTION_HEALTH_LOG_DAYS") {
			sc.retention.health_log_days = v;
			info!(v, "scheduler config: retention_health_log_days overridden by env");
		}

		if let Some(v) = non_empty(lookup("DISPATCH_WORKER_HEALTH_BIND")) {
			info!(bind = %v, "scheduler config: health_bind overridden by env");
			sc.health_bind = Some(v);
		}

		if let Some(v) = non_empty(lookup("DISPATCH_METRICS_BIND")) {
			sc.metrics_bind = Some(v);
			info!("scheduler config: metrics_bind overridden by env");
		}
	}
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

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn lookup(pairs: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<&str, &str> = pairs.iter().copied().collect();
		move |k: &str| map.get(k).map(|v| v.to_string())
	}

	#[test]
	fn defaults_match_documented_values() {
		let cfg = WorkerConfig::from_file(FileConfig::default());
		let sc = &cfg.scheduler;
		assert!(sc.database_url.is_none());
		assert_eq!(sc.lock_key, DEFAULT_LOCK_KEY);
		assert_eq!(sc.lock_ttl, Duration::from_secs(60));
		assert_eq!(sc.acquire_backoff, Duration::from_secs(5));
		assert_eq!(sc.duty_interval, Duration::from_secs(30));
		assert_eq!(sc.alerts_interval, Duration::from_secs(10));
		assert_eq!(sc.retention_interval, Duration::from_secs(86_400));
		assert_eq!(sc.thresholds, AlertThresholds::default());
	}

	#[test]
	fn intervals_are_clamped() {
		let file: FileConfig = toml::from_str(
			r#"
[scheduler]
duty_interval_secs = 1
alerts_interval_secs = 1
retention_points_days = 2
"#,
		)
		.unwrap();
		let mut cfg = WorkerConfig::from_file(file);
		assert_eq!(cfg.scheduler.duty_interval, Duration::from_secs(5));
		assert_eq!(cfg.scheduler.alerts_interval, Duration::from_secs(3));
		assert_eq!(cfg.scheduler.retention.effective_points_days(), 7);

		cfg.apply_env_overrides(&lookup(&[("DUTY_SCHEDULER_INTERVAL_SEC", "0")]));
		assert_eq!(cfg.scheduler.duty_interval, Duration::from_secs(5));
	}

	#[test]
	fn env_wins_over_file() {
		let file: FileConfig = toml::from_str(
			r#"
[scheduler]
database_url = "sqlite://file.db"
lock_ttl_secs = 30
"#,
		)
		.unwrap();
		let mut cfg = WorkerConfig::from_file(file);
		cfg.apply_env_overrides(&lookup(&[
			("DATABASE_URL", "postgres://db/dispatch"),
			("SCHEDULER_LOCK_KEY", "ops:lock"),
			("SCHEDULER_LOCK_TTL_SEC", "20"),
			("TRACKER_BATTERY_CRIT", "5"),
			("TRACKER_RETENTION_HEALTH_LOG_DAYS", "14"),
		]));

		let sc = &cfg.scheduler;
		assert_eq!(sc.database_url.as_ref().map(|u| u.expose()), Some("postgres://db/dispatch"));
		assert_eq!(sc.lock_key, "ops:lock");
		assert_eq!(sc.lock_ttl, Duration::from_secs(20));
		assert_eq!(sc.thresholds.battery_crit, 5);
		assert_eq!(sc.retention.effective_health_log_days(), 14);
	}

	#[test]
	fn lock_ttl_never_below_two_renewals() {
		let file: FileConfig = toml::from_str(
			r#"
[scheduler]
lock_ttl_secs = 4
"#,
		)
		.unwrap();
		let mut cfg = WorkerConfig::from_file(file);
		assert_eq!(cfg.scheduler.lock_ttl, Duration::from_secs(MIN_LOCK_TTL_SECS));

		cfg.apply_env_overrides(&lookup(&[("SCHEDULER_LOCK_TTL_SEC", "3")]));
		assert_eq!(cfg.scheduler.lock_ttl, Duration::from_secs(10));

		cfg.apply_env_overrides(&lookup(&[("SCHEDULER_LOCK_TTL_SEC", "0")]));
		assert_eq!(cfg.scheduler.lock_ttl, Duration::from_secs(10));
	}

	#[test]
	fn health_thresholds_from_file_and_env() {
		let file: FileConfig = toml::from_str(
			r#"
[scheduler]
stale_health_secs = 240
queue_warn = 20
"#,
		)
		.unwrap();
		let mut cfg = WorkerConfig::from_file(file);
		cfg.apply_env_overrides(&lookup(&[
			("TRACKER_QUEUE_CRIT", "60"),
			("TRACKER_ACCURACY_WARN_M", "30"),
			("TRACKER_ACCURACY_CRIT_M", "90"),
		]));

		let t = cfg.scheduler.thresholds;
		assert_eq!(t.stale_health_secs, 240);
		assert_eq!(t.queue_warn, 20);
		assert_eq!(t.queue_crit, 60);
		assert_eq!(t.accuracy_warn_m, 30);
		assert_eq!(t.accuracy_crit_m, 90);
		assert_eq!(t.battery_low, 15);
	}
}
