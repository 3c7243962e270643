#![forbid(unsafe_code)]

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::transport::PubSubTransport;

/// Lazily created, reusable command connection.
pub(crate) struct LazyManager {
	client: redis::Client,
	conn: Mutex<Option<ConnectionManager>>,
}

impl LazyManager {
	pub(crate) fn new(client: redis::Client) -> Self {
		Self {
			client,
			conn: Mutex::new(None),
		}
	}

	pub(crate) fn client(&self) -> &redis::Client {
		&self.client
	}

	pub(crate) async fn get(&self) -> anyhow::Result<ConnectionManager> {
		let mut guard = self.conn.lock().await;
		if let Some(conn) = guard.as_ref() {
			return Ok(conn.clone());
		}

		let conn = self
			.client
			.get_connection_manager()
			.await
			.context("connect redis")?;
		*guard = Some(conn.clone());
		Ok(conn)
	}

	/// Drop the cached connection so the next `get` reconnects.
	pub(crate) async fn reset(&self) {
		self.conn.lock().await.take();
	}
}

/// Redis-backed transport: shared manager for PUBLISH, one pub/sub connection per
/// subscription.
pub struct RedisTransport {
	manager: LazyManager,
}

impl std::fmt::Debug for RedisTransport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisTransport").finish_non_exhaustive()
	}
}

impl RedisTransport {
	/// Validates the URL; no connection is opened until first use.
	pub fn open(url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("parse redis url")?;
		Ok(Self {
			manager: LazyManager::new(client),
		})
	}

	async fn publish_once(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
		let mut conn = self.manager.get().await?;
		let receivers: i64 = redis::cmd("PUBLISH")
			.arg(channel)
			.arg(payload)
			.query_async(&mut conn)
			.await
			.context("redis PUBLISH")?;
		debug!(%channel, receivers, "redis publish");
		Ok(())
	}
}

#[async_trait]
impl PubSubTransport for RedisTransport {
	fn name(&self) -> &'static str {
		"redis"
	}

	async fn publish(&self, channel: &str, payload: String) -> anyhow::Result<()> {
		match self.publish_once(channel, &payload).await {
			Ok(()) => Ok(()),
			Err(e) => {
				warn!(%channel, error = %e, "redis publish failed; reconnecting once");
				self.manager.reset().await;
				self.publish_once(channel, &payload).await
			}
		}
	}

	async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, String>> {
		let mut pubsub = self
			.manager
			.client()
			.get_async_pubsub()
			.await
			.context("open redis pubsub connection")?;
		pubsub
			.subscribe(channel)
			.await
			.with_context(|| format!("redis SUBSCRIBE {channel}"))?;

		let stream = pubsub
			.into_on_message()
			.map(|msg| String::from_utf8_lossy(msg.get_payload_bytes()).into_owned());

		Ok(stream.boxed())
	}
}
