#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use dispatch_domain::{Envelope, Identity, Role};
use serde_json::json;
use tokio::time::timeout;

use crate::server::embedded::EmbeddedHub;
use crate::server::hub::{HubConfig, RealtimeHub};
use crate::server::registry::{ClientRegistration, ClientRegistry, Outbound, SweepOutcome};

fn identity(name: &str) -> Identity {
	Identity {
		subject: name.to_string(),
		role: Role::Viewer,
	}
}

#[tokio::test]
async fn failing_connection_is_removed_after_sweep() {
	let registry = ClientRegistry::new("test");

	let (healthy, mut healthy_rx) = ClientRegistration::new(identity("ok"), 8);
	let (broken, broken_rx) = ClientRegistration::new(identity("gone"), 8);
	drop(broken_rx);

	registry.register(healthy).await;
	registry.register(broken).await;
	assert_eq!(registry.len(), 2);

	let payload: Outbound = Arc::from(r#"{"event":"x","data":{}}"#);
	let outcome = registry.sweep(&payload).await;
	assert_eq!(outcome, SweepOutcome { delivered: 1, failed: 1 });

	let got = timeout(Duration::from_millis(100), healthy_rx.recv())
		.await
		.expect("healthy connection receives")
		.expect("queue open");
	assert_eq!(&*got, &*payload);
	assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn full_queue_counts_as_failure() {
	let registry = ClientRegistry::new("test");
	let (reg, _rx) = ClientRegistration::new(identity("slow"), 1);
	registry.register(reg).await;

	let payload: Outbound = Arc::from("{}");
	assert_eq!(registry.sweep(&payload).await.delivered, 1);
	assert_eq!(registry.sweep(&payload).await.failed, 1);
	assert!(registry.is_empty());
}

#[tokio::test]
async fn per_connection_order_is_fifo() {
	let registry = ClientRegistry::new("test");
	let (reg, mut rx) = ClientRegistration::new(identity("a"), 64);
	registry.register(reg).await;

	for i in 0..10 {
		registry.sweep(&Arc::from(i.to_string().as_str())).await;
	}
	for i in 0..10 {
		assert_eq!(&*rx.recv().await.unwrap(), i.to_string().as_str());
	}
}

#[tokio::test]
async fn unregister_closes_writer_queue() {
	let registry = ClientRegistry::new("test");
	let (reg, mut rx) = ClientRegistration::new(identity("a"), 4);
	let session = reg.session;
	registry.register(reg).await;

	assert!(registry.unregister(session).await);
	assert!(!registry.unregister(session).await);
	assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn embedded_broadcast_local_goes_through_pump() {
	let hub = EmbeddedHub::start(HubConfig::default());
	let (reg, mut rx) = ClientRegistration::new(identity("admin1"), 8);
	hub.register(reg).await;

	let envelope = Envelope::with_value("pending_created", json!({ "id": 777 }));
	assert!(hub.broadcast_local(envelope.clone()));

	let got = timeout(Duration::from_millis(250), rx.recv()).await.unwrap().unwrap();
	assert_eq!(Envelope::from_json(&got).unwrap(), envelope);
	assert_eq!(hub.client_count(), 1);

	assert_eq!(hub.drain().await, 1);
	assert_eq!(hub.client_count(), 0);
	assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn empty_hub_broadcast_is_a_no_op() {
	let hub = EmbeddedHub::start(HubConfig {
		client_queue_capacity: 1,
		broadcast_queue_capacity: 1,
	});
	for _ in 0..10 {
		assert!(hub.broadcast_local(Envelope::with_value("x", json!({}))));
	}
	assert_eq!(hub.broadcast_now(&Envelope::with_value("x", json!({}))).await, 0);
}
