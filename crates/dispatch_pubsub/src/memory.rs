#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, broadcast};
use tracing::warn;

use crate::transport::PubSubTransport;

/// In-process transport: one broadcast channel per name.
#[derive(Debug)]
pub struct MemoryTransport {
	channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
	capacity: usize,
	offline: AtomicBool,
}

impl Default for MemoryTransport {
	fn default() -> Self {
		Self::new(1024)
	}
}

impl MemoryTransport {
	pub fn new(capacity: usize) -> Self {
		Self {
			channels: Mutex::new(HashMap::new()),
			capacity: capacity.max(1),
			offline: AtomicBool::new(false),
		}
	}

	/// Simulate an outage: publishes and new subscriptions fail while set.
	pub fn set_offline(&self, offline: bool) {
		self.offline.store(offline, Ordering::Relaxed);
	}

	async fn sender(&self, channel: &str) -> broadcast::Sender<String> {
		let mut channels = self.channels.lock().await;
		channels
			.entry(channel.to_string())
			.or_insert_with(|| broadcast::channel(self.capacity).0)
			.clone()
	}
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
	fn name(&self) -> &'static str {
		"memory"
	}

	async fn publish(&self, channel: &str, payload: String) -> anyhow::Result<()> {
		if self.offline.load(Ordering::Relaxed) {
			return Err(anyhow!("memory transport offline"));
		}

		// No receivers is not an error: nobody is listening on that channel yet.
		let _ = self.sender(channel).await.send(payload);
		Ok(())
	}

	async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, String>> {
		if self.offline.load(Ordering::Relaxed) {
			return Err(anyhow!("memory transport offline"));
		}

		let rx = self.sender(channel).await.subscribe();
		let channel = channel.to_string();

		let stream = futures::stream::unfold((rx, channel), |(mut rx, channel)| async move {
			loop {
				match rx.recv().await {
					Ok(payload) => return Some((payload, (rx, channel))),
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!(%channel, dropped = n, "memory transport: subscriber lagged");
					}
					Err(broadcast::error::RecvError::Closed) => return None,
				}
			}
		});

		Ok(stream.boxed())
	}
}
