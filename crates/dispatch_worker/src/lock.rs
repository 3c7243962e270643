#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use dispatch_pubsub::LeaseStore;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{MIN_LOCK_TTL_SECS, SchedulerSettings};

const MIN_RENEW_EVERY: Duration = Duration::from_secs(5);
const MIN_TTL: Duration = Duration::from_secs(MIN_LOCK_TTL_SECS);

/// The lease expired or was taken over; scheduling must stop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("scheduler lock lost: {key}")]
pub struct LeadershipLost {
	pub key: String,
}

/// Single-leader guard around one lease record.
///
/// Without a store every call succeeds, so a lone worker keeps running without
/// coordination.
pub struct SchedulerLock {
	store: Option<Arc<dyn LeaseStore>>,
	key: String,
	owner: String,
	ttl: Duration,
	backoff: Duration,
}

impl std::fmt::Debug for SchedulerLock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SchedulerLock")
			.field("guarded", &self.store.is_some())
			.field("key", &self.key)
			.field("owner", &self.owner)
			.field("ttl", &self.ttl)
			.finish()
	}
}

/// `<hostname>:<uuid>`, unique per process.
pub fn process_owner() -> String {
	let host = dispatch_util::env::non_empty(std::env::var("HOSTNAME").ok()).unwrap_or_else(|| "localhost".to_string());
	format!("{host}:{}", uuid::Uuid::new_v4().simple())
}

impl SchedulerLock {
	pub fn new(store: Option<Arc<dyn LeaseStore>>, settings: &SchedulerSettings, owner: String) -> Self {
		Self {
			store,
			key: settings.lock_key.clone(),
			owner,
			ttl: settings.lock_ttl.max(MIN_TTL),
			backoff: settings.acquire_backoff,
		}
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn owner(&self) -> &str {
		&self.owner
	}

	/// Lease lifetime, never shorter than two renewal periods.
	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	pub fn is_guarded(&self) -> bool {
		self.store.is_some()
	}

	/// `max(5s, ttl / 2)` in whole seconds.
	pub fn renew_every(&self) -> Duration {
		Duration::from_secs(self.ttl.as_secs() / 2).max(MIN_RENEW_EVERY)
	}

	/// Block until leading. Returns `false` if shutdown was requested first.
	pub async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
		let Some(store) = self.store.as_ref() else {
			warn!(key = %self.key, "no lock service configured; running without distributed lock");
			return true;
		};

		loop {
			if *shutdown.borrow() {
				return false;
			}

			match store.try_acquire(&self.key, &self.owner, self.ttl).await {
				Ok(true) => {
					metrics::counter!("dispatch_worker_lock_acquired_total").increment(1);
					info!(key = %self.key, owner = %self.owner, "scheduler lock acquired");
					return true;
				}
				Ok(false) => {
					info!(key = %self.key, retry_in = ?self.backoff, "scheduler lock busy");
				}
				Err(e) => {
					warn!(key = %self.key, error = %e, retry_in = ?self.backoff, "scheduler lock acquire failed");
				}
			}

			tokio::select! {
				_ = tokio::time::sleep(self.backoff) => {}
				_ = shutdown.changed() => return false,
			}
		}
	}

	/// Refresh the lease. Any failure, including a transport error, is a loss.
	pub async fn renew(&self) -> Result<(), LeadershipLost> {
		let Some(store) = self.store.as_ref() else {
			return Ok(());
		};

		let result = store.try_renew(&self.key, &self.owner, self.ttl).await;
		let renewed = match result {
			Ok(renewed) => renewed,
			Err(e) => {
				warn!(key = %self.key, error = %e, "scheduler lock renew failed");
				false
			}
		};

		if renewed {
			metrics::counter!("dispatch_worker_lock_renewals_total", "result" => "ok").increment(1);
			Ok(())
		} else {
			metrics::counter!("dispatch_worker_lock_renewals_total", "result" => "lost").increment(1);
			error!(key = %self.key, owner = %self.owner, "scheduler lock lost");
			Err(LeadershipLost { key: self.key.clone() })
		}
	}

	/// Best-effort release on orderly shutdown.
	pub async fn release(&self) {
		let Some(store) = self.store.as_ref() else {
			return;
		};
		match store.release(&self.key, &self.owner).await {
			Ok(true) => info!(key = %self.key, "scheduler lock released"),
			Ok(false) => {}
			Err(e) => warn!(key = %self.key, error = %e, "scheduler lock release failed"),
		}
	}
}
