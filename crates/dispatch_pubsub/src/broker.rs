#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use dispatch_domain::Envelope;
use futures::StreamExt as _;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::redis_transport::RedisTransport;
use crate::settings::BrokerSettings;
use crate::transport::PubSubTransport;

const LISTEN_BACKOFF_MIN: Duration = Duration::from_secs(1);
const LISTEN_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Publishes and listens for envelopes on named channels.
///
/// With no transport configured every publish returns `false` and listeners return
/// immediately, so callers fall back to local-only delivery.
#[derive(Clone)]
pub struct EventBroker {
	transport: Option<Arc<dyn PubSubTransport>>,
	channel: String,
}

impl std::fmt::Debug for EventBroker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventBroker")
			.field("transport", &self.transport.as_ref().map(|t| t.name()))
			.field("channel", &self.channel)
			.finish()
	}
}

impl EventBroker {
	pub fn new(transport: Arc<dyn PubSubTransport>, channel: impl Into<String>) -> Self {
		Self {
			transport: Some(transport),
			channel: channel.into(),
		}
	}

	/// Broker with no pub/sub service.
	pub fn disabled(channel: impl Into<String>) -> Self {
		Self {
			transport: None,
			channel: channel.into(),
		}
	}

	/// Redis transport when a URL is configured, otherwise disabled.
	pub fn from_settings(settings: &BrokerSettings) -> anyhow::Result<Self> {
		let Some(url) = settings.redis_url.as_ref() else {
			info!(channel = %settings.channel, "broker: no redis url configured; local delivery only");
			return Ok(Self::disabled(settings.channel.clone()));
		};

		let transport = RedisTransport::open(url.expose()).context("configure redis broker")?;
		info!(channel = %settings.channel, "broker: redis transport configured");
		Ok(Self::new(Arc::new(transport), settings.channel.clone()))
	}

	pub fn is_enabled(&self) -> bool {
		self.transport.is_some()
	}

	/// Default channel.
	pub fn channel(&self) -> &str {
		&self.channel
	}

	/// Best-effort publish. `false` means the caller should deliver locally.
	pub async fn publish(&self, channel: &str, envelope: &Envelope) -> bool {
		let Some(transport) = self.transport.as_ref() else {
			return false;
		};

		match transport.publish(channel, envelope.to_json()).await {
			Ok(()) => {
				metrics::counter!("dispatch_realtime_broker_publish_total", "result" => "ok").increment(1);
				true
			}
			Err(e) => {
				metrics::counter!("dispatch_realtime_broker_publish_total", "result" => "error").increment(1);
				warn!(%channel, event = %envelope.event, error = %e, "broker publish failed");
				false
			}
		}
	}

	/// Publish `{event, data}` on the default channel.
	pub async fn publish_event(&self, event: &str, data: Map<String, Value>) -> bool {
		let envelope = Envelope::new(event, data);
		self.publish(&self.channel, &envelope).await
	}

	/// Deliver every well-formed envelope on `channel` to `on_message` until the
	/// subscription ends. Malformed payloads are dropped.
	pub async fn listen<F>(&self, channel: &str, mut on_message: F) -> anyhow::Result<()>
	where
		F: FnMut(Envelope) + Send,
	{
		let Some(transport) = self.transport.as_ref() else {
			return Ok(());
		};

		let mut stream = transport.subscribe(channel).await?;
		info!(%channel, transport = transport.name(), "broker: subscribed");

		while let Some(payload) = stream.next().await {
			match Envelope::from_json(&payload) {
				Ok(envelope) => on_message(envelope),
				Err(e) => {
					metrics::counter!("dispatch_realtime_broker_malformed_total").increment(1);
					debug!(%channel, error = %e, "broker: dropping malformed payload");
				}
			}
		}

		Ok(())
	}

	/// Run `listen` in a background task, re-subscribing with backoff whenever the
	/// subscription fails or ends, until `shutdown` flips to `true`.
	pub fn spawn_listener<F>(&self, channel: String, mut on_message: F, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()>
	where
		F: FnMut(Envelope) + Send + 'static,
	{
		let broker = self.clone();

		tokio::spawn(async move {
			if !broker.is_enabled() {
				debug!(%channel, "broker disabled; listener not started");
				return;
			}

			let mut backoff = LISTEN_BACKOFF_MIN;
			loop {
				if *shutdown.borrow() {
					break;
				}

				let outcome = tokio::select! {
					r = broker.listen(&channel, &mut on_message) => r,
					_ = shutdown.changed() => break,
				};

				match outcome {
					Ok(()) => {
						warn!(%channel, "broker subscription ended; resubscribing");
						backoff = LISTEN_BACKOFF_MIN;
					}
					Err(e) => {
						warn!(%channel, error = %e, retry_in_ms = backoff.as_millis() as u64, "broker subscribe failed");
					}
				}
				metrics::counter!("dispatch_realtime_broker_resubscribe_total").increment(1);

				tokio::select! {
					_ = tokio::time::sleep(backoff) => {}
					_ = shutdown.changed() => break,
				}
				backoff = (backoff * 2).min(LISTEN_BACKOFF_MAX);
			}

			info!(%channel, "broker listener stopped");
		})
	}
}
