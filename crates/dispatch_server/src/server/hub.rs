#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use dispatch_domain::{Envelope, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::registry::{ClientRegistration, ClientRegistry, Outbound};

/// Sizing for a hub instance.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Per-connection outbound queue.
	pub client_queue_capacity: usize,
	/// Cross-thread hand-off queue feeding the pump task.
	pub broadcast_queue_capacity: usize,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			client_queue_capacity: 256,
			broadcast_queue_capacity: 1024,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubFlavor {
	Embedded,
	Standalone,
}

impl HubFlavor {
	pub const fn as_str(self) -> &'static str {
		match self {
			HubFlavor::Embedded => "embedded",
			HubFlavor::Standalone => "standalone",
		}
	}
}

/// Live set of local client connections plus local fan-out.
#[async_trait]
pub trait RealtimeHub: Send + Sync + 'static {
	fn flavor(&self) -> HubFlavor;

	fn registry(&self) -> &ClientRegistry;

	async fn register(&self, reg: ClientRegistration) {
		self.registry().register(reg).await;
	}

	async fn unregister(&self, session: SessionId) -> bool {
		self.registry().unregister(session).await
	}

	/// Push `envelope` to every local connection without waiting for delivery.
	/// Returns `false` only when the hand-off queue rejected it.
	fn broadcast_local(&self, envelope: Envelope) -> bool;

	fn client_count(&self) -> usize {
		self.registry().len()
	}
}

/// Non-blocking hand-off onto a pump queue. Empty registries skip the queue entirely.
pub(crate) fn enqueue(
	queue: &mpsc::Sender<Envelope>,
	registry: &ClientRegistry,
	flavor: HubFlavor,
	envelope: Envelope,
) -> bool {
	if registry.is_empty() {
		return true;
	}

	match queue.try_send(envelope) {
		Ok(()) => true,
		Err(mpsc::error::TrySendError::Full(envelope)) => {
			metrics::counter!("dispatch_realtime_broadcast_dropped_total", "flavor" => flavor.as_str()).increment(1);
			warn!(flavor = flavor.as_str(), event = %envelope.event, "hub broadcast queue full; dropping event");
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => {
			debug!(flavor = flavor.as_str(), "hub pump stopped; dropping event");
			false
		}
	}
}

/// Serialize once and sweep the registry.
pub(crate) async fn fan_out(registry: &ClientRegistry, flavor: HubFlavor, envelope: &Envelope) -> usize {
	if registry.is_empty() {
		return 0;
	}

	let payload: Outbound = Arc::from(envelope.to_json());
	let outcome = registry.sweep(&payload).await;
	metrics::counter!("dispatch_realtime_broadcasts_total", "flavor" => flavor.as_str()).increment(1);
	if outcome.failed > 0 {
		debug!(
			flavor = flavor.as_str(),
			event = %envelope.event,
			delivered = outcome.delivered,
			failed = outcome.failed,
			"hub broadcast dropped failing connections"
		);
	}
	outcome.delivered
}

/// Drains the hand-off queue until every sender is gone.
pub(crate) async fn run_pump(registry: ClientRegistry, flavor: HubFlavor, mut rx: mpsc::Receiver<Envelope>) {
	debug!(flavor = flavor.as_str(), "hub pump started");
	while let Some(envelope) = rx.recv().await {
		fan_out(&registry, flavor, &envelope).await;
	}
	debug!(flavor = flavor.as_str(), "hub pump stopped");
}
