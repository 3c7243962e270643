#![forbid(unsafe_code)]

use std::sync::Arc;

use dispatch_domain::Envelope;
use dispatch_pubsub::EventBroker;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::server::hub::RealtimeHub;

/// How an event left this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	/// Published to the broker; every process's listeners deliver it.
	Broker,
	/// Broker unavailable; pushed to this process's hubs only.
	Local,
}

/// Connects the broker to the hubs running in this process.
#[derive(Clone)]
pub struct RealtimeBridge {
	broker: EventBroker,
	hubs: Vec<Arc<dyn RealtimeHub>>,
}

impl std::fmt::Debug for RealtimeBridge {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RealtimeBridge")
			.field("broker", &self.broker)
			.field("hubs", &self.hubs.iter().map(|h| h.flavor()).collect::<Vec<_>>())
			.finish()
	}
}

impl RealtimeBridge {
	pub fn new(broker: EventBroker, hubs: Vec<Arc<dyn RealtimeHub>>) -> Self {
		Self { broker, hubs }
	}

	/// Broker first; on failure fall back to local delivery.
	pub async fn broadcast_event(&self, event: &str, data: Map<String, Value>) -> Delivery {
		let envelope = Envelope::new(event, data);
		if self.broker.publish(self.broker.channel(), &envelope).await {
			return Delivery::Broker;
		}

		debug!(event = %envelope.event, "broker unavailable; delivering locally");
		self.broadcast_local_all(envelope);
		Delivery::Local
	}

	pub fn broadcast_local_all(&self, envelope: Envelope) {
		for hub in &self.hubs {
			hub.broadcast_local(envelope.clone());
		}
	}

	/// One supervised broker listener per channel, feeding every hub.
	pub fn spawn_listeners(&self, channels: &[String], shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
		channels
			.iter()
			.map(|channel| {
				let bridge = self.clone();
				self.broker.spawn_listener(
					channel.clone(),
					move |envelope| bridge.broadcast_local_all(envelope),
					shutdown.clone(),
				)
			})
			.collect()
	}

	/// Sum over hubs.
	pub fn client_count(&self) -> usize {
		self.hubs.iter().map(|h| h.client_count()).sum()
	}
}
