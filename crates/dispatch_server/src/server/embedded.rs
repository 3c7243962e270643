#![forbid(unsafe_code)]

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use dispatch_domain::{Envelope, Identity};
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::server::gate::{CLOSE_HANDSHAKE_WAIT, GateRejection};
use crate::server::hub::{self, HubConfig, HubFlavor, RealtimeHub};
use crate::server::registry::{ClientRegistration, ClientRegistry};
use crate::server::signaling;

/// Hub sharing the HTTP server's runtime; sockets arrive through axum's `/ws` route.
#[derive(Debug, Clone)]
pub struct EmbeddedHub {
	registry: ClientRegistry,
	queue: mpsc::Sender<Envelope>,
	cfg: HubConfig,
}

impl EmbeddedHub {
	/// Spawn the pump on the current runtime.
	pub fn start(cfg: HubConfig) -> Self {
		let registry = ClientRegistry::new(HubFlavor::Embedded.as_str());
		let (queue, rx) = mpsc::channel(cfg.broadcast_queue_capacity.max(1));
		tokio::spawn(hub::run_pump(registry.clone(), HubFlavor::Embedded, rx));
		info!("embedded hub started");
		Self { registry, queue, cfg }
	}

	/// Sweep directly, for callers already on the runtime. Returns connections reached.
	pub async fn broadcast_now(&self, envelope: &Envelope) -> usize {
		hub::fan_out(&self.registry, HubFlavor::Embedded, envelope).await
	}

	/// Unregister every connection; each writer then closes its socket.
	pub async fn drain(&self) -> usize {
		let n = self.registry.clear().await;
		info!(closed = n, "embedded hub drained");
		n
	}

	/// Run an admitted socket until either side closes it.
	pub async fn serve_socket(&self, socket: WebSocket, identity: Identity) {
		let (reg, mut rx) = ClientRegistration::new(identity, self.cfg.client_queue_capacity);
		let session = reg.session;
		self.register(reg).await;
		metrics::counter!("dispatch_realtime_connections_total", "flavor" => "embedded").increment(1);

		let (mut sink, mut stream) = socket.split();

		tokio::spawn(async move {
			while let Some(text) = rx.recv().await {
				if sink.send(Message::Text(text.to_string().into())).await.is_err() {
					return;
				}
			}
			let _ = sink.send(Message::Close(None)).await;
		});

		while let Some(Ok(msg)) = stream.next().await {
			match msg {
				Message::Text(text) => {
					signaling::relay(&self.registry, session, text.as_str()).await;
				}
				Message::Close(_) => break,
				_ => {}
			}
		}

		self.unregister(session).await;
		debug!(%session, "embedded socket closed");
	}
}

/// Complete the upgrade and immediately close with the rejection's code.
pub async fn reject_socket(mut socket: WebSocket, rejection: GateRejection) {
	let frame = CloseFrame {
		code: rejection.code,
		reason: Utf8Bytes::from_static(rejection.reason),
	};
	let _ = socket.send(Message::Close(Some(frame))).await;
	let _ = tokio::time::timeout(CLOSE_HANDSHAKE_WAIT, async { while let Some(Ok(_)) = socket.recv().await {} }).await;
}

impl RealtimeHub for EmbeddedHub {
	fn flavor(&self) -> HubFlavor {
		HubFlavor::Embedded
	}

	fn registry(&self) -> &ClientRegistry {
		&self.registry
	}

	fn broadcast_local(&self, envelope: Envelope) -> bool {
		hub::enqueue(&self.queue, &self.registry, HubFlavor::Embedded, envelope)
	}
}
