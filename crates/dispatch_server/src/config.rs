#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use dispatch_domain::SecretString;
use dispatch_pubsub::{BrokerSettings, FileBrokerSettings};
use dispatch_util::env::{non_empty, parse_env_bool, process_env, split_csv};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.dispatch/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".dispatch").join("config.toml"))
}

/// Load the server config from TOML and process env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	cfg.apply_env_overrides(&process_env);

	Ok(cfg)
}

/// Which hub flavors run in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HubMode {
	#[default]
	Embedded,
	Standalone,
	Both,
}

impl HubMode {
	pub fn runs_embedded(self) -> bool {
		matches!(self, HubMode::Embedded | HubMode::Both)
	}

	pub fn runs_standalone(self) -> bool {
		matches!(self, HubMode::Standalone | HubMode::Both)
	}
}

impl FromStr for HubMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"embedded" | "asgi" => Ok(HubMode::Embedded),
			"standalone" | "port" => Ok(HubMode::Standalone),
			"both" => Ok(HubMode::Both),
			other => Err(format!("unknown realtime mode: {other} (expected embedded|standalone|both)")),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub broker: BrokerSettings,
	pub realtime: RealtimeSettings,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
	/// Token signing key; unset means sockets close with 1011 and token issuance is 503.
	pub secret_key: Option<SecretString>,
	pub token_ttl: Duration,
	/// Exact-match origin allow-list; empty means same-host policy.
	pub allowed_origins: Vec<String>,
	pub mode: HubMode,
	pub http_bind: String,
	pub ws_host: String,
	pub ws_port: u16,
	pub disable_sameport: bool,
	/// Per-connection outbound queue.
	pub client_queue_capacity: usize,
	pub metrics_bind: Option<String>,
}

impl Default for RealtimeSettings {
	fn default() -> Self {
		Self {
			secret_key: None,
			token_ttl: Duration::from_secs(600),
			allowed_origins: Vec::new(),
			mode: HubMode::Embedded,
			http_bind: "0.0.0.0:8080".to_string(),
			ws_host: "0.0.0.0".to_string(),
			ws_port: 8765,
			disable_sameport: false,
			client_queue_capacity: 256,
			metrics_bind: None,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	broker: FileBrokerSettings,

	#[serde(default)]
	realtime: FileRealtimeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRealtimeSettings {
	secret_key: Option<String>,
	token_ttl_secs: Option<u64>,
	#[serde(default)]
	allowed_origins: Vec<String>,
	mode: Option<String>,
	http_bind: Option<String>,
	ws_host: Option<String>,
	ws_port: Option<u16>,
	disable_sameport: Option<bool>,
	client_queue_capacity: Option<usize>,
	metrics_bind: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = RealtimeSettings::default();
		let r = file.realtime;

		let mode = match r.mode.as_deref().map(str::parse::<HubMode>) {
			Some(Ok(mode)) => mode,
			Some(Err(e)) => {
				warn!(error = %e, "realtime config: invalid mode; using embedded");
				HubMode::Embedded
			}
			None => defaults.mode,
		};

		Self {
			broker: BrokerSettings::from_file(file.broker),
			realtime: RealtimeSettings {
				secret_key: non_empty(r.secret_key).map(SecretString::new),
				token_ttl: r
					.token_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.token_ttl),
				allowed_origins: r.allowed_origins.into_iter().filter_map(|o| non_empty(Some(o))).collect(),
				mode,
				http_bind: non_empty(r.http_bind).unwrap_or(defaults.http_bind),
				ws_host: non_empty(r.ws_host).unwrap_or(defaults.ws_host),
				ws_port: r.ws_port.filter(|p| *p > 0).unwrap_or(defaults.ws_port),
				disable_sameport: r.disable_sameport.unwrap_or(defaults.disable_sameport),
				client_queue_capacity: r
					.client_queue_capacity
					.filter(|c| *c > 0)
					.unwrap_or(defaults.client_queue_capacity),
				metrics_bind: non_empty(r.metrics_bind),
			},
		}
	}

	pub fn apply_env_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
		self.broker.apply_env_overrides(lookup);
		let rt = &mut self.realtime;

		if let Some(v) = non_empty(lookup("REALTIME_SECRET_KEY")) {
			rt.secret_key = Some(SecretString::new(v));
			info!("realtime config: secret_key overridden by env");
		} else if let Some(v) = non_empty(lookup("SECRET_KEY")) {
			rt.secret_key = Some(SecretString::new(v));
			info!("realtime config: secret_key taken from SECRET_KEY");
		}

		if let Some(v) = lookup("REALTIME_TOKEN_TTL_SEC")
			&& let Ok(secs) = v.trim().parse::<u64>()
			&& secs > 0
		{
			rt.token_ttl = Duration::from_secs(secs);
			info!(secs, "realtime config: token_ttl overridden by env");
		}

		if let Some(v) = lookup("REALTIME_ALLOWED_ORIGINS") {
			rt.allowed_origins = split_csv(&v);
			info!(
				count = rt.allowed_origins.len(),
				"realtime config: allowed_origins overridden by env"
			);
		}

		if let Some(v) = non_empty(lookup("REALTIME_MODE")) {
			match v.parse::<HubMode>() {
				Ok(mode) => {
					rt.mode = mode;
					info!(?mode, "realtime config: mode overridden by env");
				}
				Err(e) => warn!(error = %e, "realtime config: ignoring REALTIME_MODE"),
			}
		}

		if let Some(v) = non_empty(lookup("REALTIME_HTTP_BIND")) {
			info!(bind = %v, "realtime config: http_bind overridden by env");
			rt.http_bind = v;
		}

		if let Some(v) = non_empty(lookup("WS_HOST")) {
			info!(host = %v, "realtime config: ws_host overridden by env");
			rt.ws_host = v;
		}

		if let Some(v) = lookup("WS_PORT")
			&& let Ok(port) = v.trim().parse::<u16>()
			&& port > 0
		{
			rt.ws_port = port;
			info!(port, "realtime config: ws_port overridden by env");
		}

		if let Some(v) = lookup("REALTIME_DISABLE_SAMEPORT")
			&& let Some(b) = parse_env_bool(&v)
		{
			rt.disable_sameport = b;
			info!(disable_sameport = b, "realtime config: disable_sameport overridden by env");
		}

		if let Some(v) = lookup("REALTIME_CLIENT_QUEUE")
			&& let Ok(cap) = v.trim().parse::<usize>()
			&& cap > 0
		{
			rt.client_queue_capacity = cap;
			info!(cap, "realtime config: client_queue_capacity overridden by env");
		}

		if let Some(v) = non_empty(lookup("DISPATCH_METRICS_BIND")) {
			rt.metrics_bind = Some(v);
			info!("realtime config: metrics_bind overridden by env");
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
	fn defaults_without_file() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert!(cfg.realtime.secret_key.is_none());
		assert_eq!(cfg.realtime.token_ttl, Duration::from_secs(600));
		assert_eq!(cfg.realtime.mode, HubMode::Embedded);
		assert_eq!(cfg.realtime.ws_port, 8765);
		assert_eq!(cfg.broker.channel, "dispatch:realtime");
	}

	#[test]
	fn toml_then_env() {
		let file: FileConfig = toml::from_str(
			r#"
[realtime]
secret_key = "from-file"
mode = "both"
allowed_origins = ["https://ops.example.com"]

[broker]
channel = "ops:realtime"
"#,
		)
		.unwrap();
		let mut cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.realtime.mode, HubMode::Both);

		cfg.apply_env_overrides(&lookup(&[
			("SECRET_KEY", "fallback"),
			("REALTIME_TOKEN_TTL_SEC", "120"),
			("WS_PORT", "9000"),
			("REALTIME_DISABLE_SAMEPORT", "yes"),
			("REALTIME_MODE", "standalone"),
		]));

		assert_eq!(cfg.realtime.secret_key.as_ref().map(|s| s.expose()), Some("fallback"));
		assert_eq!(cfg.realtime.token_ttl, Duration::from_secs(120));
		assert_eq!(cfg.realtime.ws_port, 9000);
		assert!(cfg.realtime.disable_sameport);
		assert_eq!(cfg.realtime.mode, HubMode::Standalone);
		assert_eq!(cfg.realtime.allowed_origins, vec!["https://ops.example.com"]);
		assert_eq!(cfg.broker.channel, "ops:realtime");
	}

	#[test]
	fn realtime_secret_key_beats_secret_key() {
		let mut cfg = ServerConfig::default();
		cfg.apply_env_overrides(&lookup(&[("REALTIME_SECRET_KEY", "rt"), ("SECRET_KEY", "app")]));
		assert_eq!(cfg.realtime.secret_key.as_ref().map(|s| s.expose()), Some("rt"));
	}
}
