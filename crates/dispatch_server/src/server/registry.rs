#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dispatch_domain::{Identity, SessionId};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Text frame queued for one connection's writer task.
pub type Outbound = Arc<str>;

/// One admitted connection: its verified identity and the handle to its writer queue.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
	pub session: SessionId,
	pub identity: Identity,
	pub sender: mpsc::Sender<Outbound>,
}

impl ClientRegistration {
	/// New registration plus the receiving end for the writer task.
	pub fn new(identity: Identity, queue_capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
		let (sender, rx) = mpsc::channel(queue_capacity.max(1));
		(
			Self {
				session: SessionId::new_v4(),
				identity,
				sender,
			},
			rx,
		)
	}
}

/// Result of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
	pub delivered: usize,
	pub failed: usize,
}

/// Live connections of one hub instance.
///
/// Mutated only through `register`/`unregister`; the count is mirrored in an atomic so
/// diagnostics never wait on the lock.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
	inner: Arc<Mutex<HashMap<SessionId, ClientRegistration>>>,
	count: Arc<AtomicUsize>,
	flavor: &'static str,
}

impl ClientRegistry {
	pub fn new(flavor: &'static str) -> Self {
		Self {
			inner: Arc::new(Mutex::new(HashMap::new())),
			count: Arc::new(AtomicUsize::new(0)),
			flavor,
		}
	}

	pub fn len(&self) -> usize {
		self.count.load(Ordering::Relaxed)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub async fn register(&self, reg: ClientRegistration) {
		let mut inner = self.inner.lock().await;
		debug!(flavor = self.flavor, session = %reg.session, identity = %reg.identity, "hub: registered");
		inner.insert(reg.session, reg);
		self.publish_count(inner.len());
	}

	/// Drop a connection. Dropping its sender ends the writer task, which closes the socket.
	pub async fn unregister(&self, session: SessionId) -> bool {
		let mut inner = self.inner.lock().await;
		let removed = inner.remove(&session).is_some();
		if removed {
			debug!(flavor = self.flavor, %session, "hub: unregistered");
			self.publish_count(inner.len());
		}
		removed
	}

	/// Unregister everything.
	pub async fn clear(&self) -> usize {
		let mut inner = self.inner.lock().await;
		let n = inner.len();
		inner.clear();
		self.publish_count(0);
		n
	}

	/// Queue `payload` on every connection in a point-in-time copy of the registry.
	/// Connections whose queue is full or closed are unregistered after the pass.
	pub async fn sweep(&self, payload: &Outbound) -> SweepOutcome {
		let targets: Vec<(SessionId, mpsc::Sender<Outbound>)> = {
			let inner = self.inner.lock().await;
			inner.iter().map(|(id, reg)| (*id, reg.sender.clone())).collect()
		};

		let mut failed = Vec::new();
		for (session, sender) in &targets {
			if sender.try_send(Arc::clone(payload)).is_err() {
				failed.push(*session);
			}
		}

		for session in &failed {
			self.unregister(*session).await;
		}

		if !failed.is_empty() {
			metrics::counter!("dispatch_realtime_send_failures_total", "flavor" => self.flavor)
				.increment(failed.len() as u64);
		}

		SweepOutcome {
			delivered: targets.len() - failed.len(),
			failed: failed.len(),
		}
	}

	/// Queue `payload` for the connections matching `pred`; failures are unregistered.
	pub async fn send_where<F>(&self, payload: &Outbound, mut pred: F) -> usize
	where
		F: FnMut(&ClientRegistration) -> bool,
	{
		let targets: Vec<(SessionId, mpsc::Sender<Outbound>)> = {
			let inner = self.inner.lock().await;
			inner
				.values()
				.filter(|reg| pred(reg))
				.map(|reg| (reg.session, reg.sender.clone()))
				.collect()
		};

		let mut delivered = 0;
		for (session, sender) in targets {
			if sender.try_send(Arc::clone(payload)).is_ok() {
				delivered += 1;
			} else {
				self.unregister(session).await;
			}
		}
		delivered
	}

	fn publish_count(&self, n: usize) {
		self.count.store(n, Ordering::Relaxed);
		metrics::gauge!("dispatch_realtime_clients", "flavor" => self.flavor).set(n as f64);
	}
}
