#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::redis_transport::LazyManager;

/// Atomic primitives over a single-owner lease record.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
	/// Set `key = owner` with `ttl` only if the key does not exist.
	async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool>;

	/// Refresh the ttl only if the stored value still equals `owner`.
	async fn try_renew(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool>;

	/// Delete the key only if the stored value still equals `owner`.
	async fn release(&self, key: &str, owner: &str) -> anyhow::Result<bool>;
}

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
	redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
	return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
	return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn ttl_secs(ttl: Duration) -> u64 {
	ttl.as_secs().max(1)
}

pub struct RedisLeaseStore {
	manager: LazyManager,
	renew: redis::Script,
	release: redis::Script,
}

impl std::fmt::Debug for RedisLeaseStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisLeaseStore").finish_non_exhaustive()
	}
}

impl RedisLeaseStore {
	pub fn open(url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("parse redis url")?;
		Ok(Self {
			manager: LazyManager::new(client),
			renew: redis::Script::new(RENEW_SCRIPT),
			release: redis::Script::new(RELEASE_SCRIPT),
		})
	}

	async fn reset_on_err<T>(&self, r: redis::RedisResult<T>) -> anyhow::Result<T> {
		match r {
			Ok(v) => Ok(v),
			Err(e) => {
				self.manager.reset().await;
				Err(e.into())
			}
		}
	}
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
	async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
		let mut conn = self.manager.get().await?;
		let reply: Option<String> = self
			.reset_on_err(
				redis::cmd("SET")
					.arg(key)
					.arg(owner)
					.arg("NX")
					.arg("EX")
					.arg(ttl_secs(ttl))
					.query_async(&mut conn)
					.await,
			)
			.await
			.context("redis SET NX EX")?;
		Ok(reply.is_some())
	}

	async fn try_renew(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
		let mut conn = self.manager.get().await?;
		let renewed: i64 = self
			.reset_on_err(
				self.renew
					.key(key)
					.arg(owner)
					.arg(ttl_secs(ttl))
					.invoke_async(&mut conn)
					.await,
			)
			.await
			.context("redis lease renew")?;
		Ok(renewed == 1)
	}

	async fn release(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
		let mut conn = self.manager.get().await?;
		let deleted: i64 = self
			.reset_on_err(self.release.key(key).arg(owner).invoke_async(&mut conn).await)
			.await
			.context("redis lease release")?;
		Ok(deleted == 1)
	}
}

/// In-process lease store on the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
	records: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLeaseStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Unconditionally overwrite the record.
	pub async fn force_set(&self, key: &str, owner: &str, ttl: Duration) {
		self.records
			.lock()
			.await
			.insert(key.to_string(), (owner.to_string(), Instant::now() + ttl));
	}

	/// Current live owner, if any.
	pub async fn owner(&self, key: &str) -> Option<String> {
		let records = self.records.lock().await;
		records
			.get(key)
			.filter(|(_, expires)| *expires > Instant::now())
			.map(|(owner, _)| owner.clone())
	}
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
	async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
		let mut records = self.records.lock().await;
		let now = Instant::now();
		if let Some((_, expires)) = records.get(key)
			&& *expires > now
		{
			return Ok(false);
		}
		records.insert(key.to_string(), (owner.to_string(), now + ttl));
		Ok(true)
	}

	async fn try_renew(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
		let mut records = self.records.lock().await;
		let now = Instant::now();
		match records.get_mut(key) {
			Some((current, expires)) if current == owner && *expires > now => {
				*expires = now + ttl;
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn release(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
		let mut records = self.records.lock().await;
		if records.get(key).is_some_and(|(current, _)| current == owner) {
			records.remove(key);
			return Ok(true);
		}
		Ok(false)
	}
}
