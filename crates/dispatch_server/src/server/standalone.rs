#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;
use dispatch_domain::Envelope;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::server::gate::{CLOSE_HANDSHAKE_WAIT, ConnectionGate, HandshakeRequest};
use crate::server::hub::{self, HubConfig, HubFlavor, RealtimeHub};
use crate::server::registry::{ClientRegistration, ClientRegistry};
use crate::server::signaling;

/// Time writers get to flush close frames before the hub thread's runtime is dropped.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Hub with its own listener, OS thread and current-thread runtime.
///
/// `broadcast_local` may be called from any thread: it queues the envelope and wakes the
/// pump running on the hub thread.
#[derive(Debug)]
pub struct StandaloneHub {
	registry: ClientRegistry,
	queue: mpsc::Sender<Envelope>,
	local_addr: SocketAddr,
	shutdown: watch::Sender<bool>,
	thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl StandaloneHub {
	/// Bind on the caller's thread (so errors surface here), then hand the listener to a
	/// dedicated `dispatch-ws` thread.
	pub fn start(bind: SocketAddr, gate: ConnectionGate, cfg: HubConfig) -> anyhow::Result<Self> {
		let std_listener = std::net::TcpListener::bind(bind).with_context(|| format!("bind standalone hub on {bind}"))?;
		std_listener.set_nonblocking(true).context("set listener non-blocking")?;
		let local_addr = std_listener.local_addr().context("standalone hub local addr")?;

		let runtime = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.thread_name("dispatch-ws")
			.build()
			.context("build standalone hub runtime")?;

		let registry = ClientRegistry::new(HubFlavor::Standalone.as_str());
		let (queue, rx) = mpsc::channel(cfg.broadcast_queue_capacity.max(1));
		let (shutdown, shutdown_rx) = watch::channel(false);

		let thread_registry = registry.clone();
		let thread = std::thread::Builder::new()
			.name("dispatch-ws".to_string())
			.spawn(move || {
				runtime.block_on(run_hub_thread(std_listener, gate, cfg, thread_registry, rx, shutdown_rx));
			})
			.context("spawn standalone hub thread")?;

		info!(%local_addr, "standalone hub listening");

		Ok(Self {
			registry,
			queue,
			local_addr,
			shutdown,
			thread: Mutex::new(Some(thread)),
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Stop accepting, close every socket and join the hub thread. Blocks the caller
	/// until the thread exits.
	pub fn shutdown(&self) {
		let _ = self.shutdown.send(true);
		let handle = self.thread.lock().ok().and_then(|mut guard| guard.take());
		if let Some(handle) = handle
			&& handle.join().is_err()
		{
			warn!("standalone hub thread panicked");
		}
	}
}

impl Drop for StandaloneHub {
	fn drop(&mut self) {
		let _ = self.shutdown.send(true);
	}
}

impl RealtimeHub for StandaloneHub {
	fn flavor(&self) -> HubFlavor {
		HubFlavor::Standalone
	}

	fn registry(&self) -> &ClientRegistry {
		&self.registry
	}

	fn broadcast_local(&self, envelope: Envelope) -> bool {
		hub::enqueue(&self.queue, &self.registry, HubFlavor::Standalone, envelope)
	}
}

async fn run_hub_thread(
	std_listener: std::net::TcpListener,
	gate: ConnectionGate,
	cfg: HubConfig,
	registry: ClientRegistry,
	rx: mpsc::Receiver<Envelope>,
	mut shutdown: watch::Receiver<bool>,
) {
	let listener = match TcpListener::from_std(std_listener) {
		Ok(l) => l,
		Err(e) => {
			warn!(error = %e, "standalone hub: failed to adopt listener");
			return;
		}
	};

	let pump = tokio::spawn(hub::run_pump(registry.clone(), HubFlavor::Standalone, rx));

	loop {
		tokio::select! {
			accepted = listener.accept() => match accepted {
				Ok((stream, peer)) => {
					tokio::spawn(handle_connection(stream, peer, gate.clone(), cfg.clone(), registry.clone()));
				}
				Err(e) => warn!(error = %e, "standalone hub accept failed"),
			},
			_ = shutdown.changed() => break,
		}
	}

	let closed = registry.clear().await;
	info!(closed, "standalone hub shutting down");
	tokio::time::sleep(SHUTDOWN_GRACE).await;
	pump.abort();
}

async fn handle_connection(
	stream: TcpStream,
	peer: SocketAddr,
	gate: ConnectionGate,
	cfg: HubConfig,
	registry: ClientRegistry,
) {
	let mut origin: Option<String> = None;
	let mut host: Option<String> = None;
	let mut query: Option<String> = None;

	let accepted = tokio_tungstenite::accept_hdr_async(
		stream,
		|req: &Request, response: Response| -> Result<Response, ErrorResponse> {
			let header = |name: &str| {
				req.headers()
					.get(name)
					.and_then(|v| v.to_str().ok())
					.map(str::to_string)
			};
			origin = header("origin");
			host = header("host");
			query = req.uri().query().map(str::to_string);
			Ok(response)
		},
	)
	.await;

	let mut ws = match accepted {
		Ok(ws) => ws,
		Err(e) => {
			debug!(%peer, error = %e, "standalone hub: websocket handshake failed");
			return;
		}
	};

	let req = HandshakeRequest {
		origin: origin.as_deref(),
		host: host.as_deref(),
		query: query.as_deref(),
	};
	let identity = match gate.admit(&req) {
		Ok(identity) => identity,
		Err(rejection) => {
			let frame = CloseFrame {
				code: CloseCode::from(rejection.code),
				reason: Utf8Bytes::from_static(rejection.reason),
			};
			let _ = ws.close(Some(frame)).await;
			let _ = tokio::time::timeout(CLOSE_HANDSHAKE_WAIT, async { while let Some(Ok(_)) = ws.next().await {} }).await;
			return;
		}
	};

	let (reg, mut rx) = ClientRegistration::new(identity, cfg.client_queue_capacity);
	let session = reg.session;
	registry.register(reg).await;
	metrics::counter!("dispatch_realtime_connections_total", "flavor" => "standalone").increment(1);

	let (mut sink, mut source) = ws.split();

	tokio::spawn(async move {
		while let Some(text) = rx.recv().await {
			if sink.send(Message::text(text.to_string())).await.is_err() {
				return;
			}
		}
		let _ = sink.close().await;
	});

	while let Some(Ok(msg)) = source.next().await {
		match msg {
			Message::Text(text) => {
				signaling::relay(&registry, session, text.as_str()).await;
			}
			Message::Close(_) => break,
			_ => {}
		}
	}

	registry.unregister(session).await;
	debug!(%session, %peer, "standalone socket closed");
}
