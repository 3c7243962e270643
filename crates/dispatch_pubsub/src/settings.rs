#![forbid(unsafe_code)]

use dispatch_domain::SecretString;
use dispatch_util::env::{non_empty, split_csv};
use serde::Deserialize;
use tracing::info;

pub const DEFAULT_CHANNEL: &str = "dispatch:realtime";

/// Broker settings shared by the server and the worker.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
	/// Pub/sub service URL; unset means local-only delivery.
	pub redis_url: Option<SecretString>,
	/// Default channel for publishes and listeners.
	pub channel: String,
	/// Extra channels listened to as well.
	pub secondary_channels: Vec<String>,
}

impl Default for BrokerSettings {
	fn default() -> Self {
		Self {
			redis_url: None,
			channel: DEFAULT_CHANNEL.to_string(),
			secondary_channels: Vec::new(),
		}
	}
}

/// `[broker]` TOML section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileBrokerSettings {
	redis_url: Option<String>,
	channel: Option<String>,
	#[serde(default)]
	secondary_channels: Vec<String>,
}

impl BrokerSettings {
	pub fn from_file(file: FileBrokerSettings) -> Self {
		Self {
			redis_url: non_empty(file.redis_url).map(SecretString::new),
			channel: non_empty(file.channel).unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
			secondary_channels: file
				.secondary_channels
				.into_iter()
				.filter_map(|c| non_empty(Some(c)))
				.collect(),
		}
	}

	pub fn apply_env_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
		if let Some(v) = non_empty(lookup("REDIS_URL")) {
			self.redis_url = Some(SecretString::new(v));
			info!("broker config: redis_url overridden by env");
		}

		if let Some(v) = non_empty(lookup("REALTIME_REDIS_CHANNEL")) {
			info!(channel = %v, "broker config: channel overridden by env");
			self.channel = v;
		}

		if let Some(v) = lookup("REALTIME_SECONDARY_CHANNELS") {
			self.secondary_channels = split_csv(&v);
			info!(
				count = self.secondary_channels.len(),
				"broker config: secondary_channels overridden by env"
			);
		}
	}

	/// Default channel first, then secondaries, without duplicates.
	pub fn all_channels(&self) -> Vec<String> {
		let mut out = vec![self.channel.clone()];
		for c in &self.secondary_channels {
			if !out.contains(c) {
				out.push(c.clone());
			}
		}
		out
	}
}
