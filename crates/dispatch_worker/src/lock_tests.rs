#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use dispatch_pubsub::{LeaseStore, MemoryLeaseStore};
use tokio::sync::watch;

use crate::config::SchedulerSettings;
use crate::lock::{LeadershipLost, SchedulerLock};

fn settings(ttl_secs: u64) -> SchedulerSettings {
	SchedulerSettings {
		lock_ttl: Duration::from_secs(ttl_secs),
		acquire_backoff: Duration::from_secs(1),
		..SchedulerSettings::default()
	}
}

fn lock(store: &Arc<MemoryLeaseStore>, owner: &str, ttl_secs: u64) -> SchedulerLock {
	let store: Arc<dyn LeaseStore> = store.clone();
	SchedulerLock::new(Some(store), &settings(ttl_secs), owner.to_string())
}

#[tokio::test(start_paused = true)]
async fn second_owner_waits_for_ttl_to_lapse() {
	let store = Arc::new(MemoryLeaseStore::new());
	let a = lock(&store, "host-a:1", 10);
	let b = Arc::new(lock(&store, "host-b:2", 10));
	let (_tx, rx) = watch::channel(false);

	assert!(a.acquire(&mut rx.clone()).await);
	assert_eq!(store.owner(a.key()).await.as_deref(), Some("host-a:1"));

	let waiter = {
		let b = b.clone();
		let mut rx = rx.clone();
		tokio::spawn(async move { b.acquire(&mut rx).await })
	};

	tokio::time::sleep(Duration::from_secs(5)).await;
	assert!(!waiter.is_finished());

	tokio::time::sleep(Duration::from_secs(7)).await;
	assert!(waiter.await.unwrap());
	assert_eq!(store.owner(a.key()).await.as_deref(), Some("host-b:2"));

	assert_eq!(
		a.renew().await,
		Err(LeadershipLost {
			key: a.key().to_string()
		})
	);
	assert!(b.renew().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn overwritten_lease_is_lost() {
	let store = Arc::new(MemoryLeaseStore::new());
	let a = lock(&store, "host-a:1", 60);
	let (_tx, mut rx) = watch::channel(false);

	assert!(a.acquire(&mut rx).await);
	assert!(a.renew().await.is_ok());

	store.force_set(a.key(), "intruder", Duration::from_secs(60)).await;
	assert!(a.renew().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn acquire_gives_up_on_shutdown() {
	let store = Arc::new(MemoryLeaseStore::new());
	store
		.force_set("dispatch:schedulers:lock", "other", Duration::from_secs(3600))
		.await;
	let a = Arc::new(lock(&store, "host-a:1", 60));
	let (tx, rx) = watch::channel(false);

	let waiter = {
		let a = a.clone();
		let mut rx = rx.clone();
		tokio::spawn(async move { a.acquire(&mut rx).await })
	};
	tokio::time::sleep(Duration::from_secs(3)).await;
	tx.send(true).unwrap();
	assert!(!waiter.await.unwrap());
}

#[tokio::test]
async fn unguarded_lock_always_leads() {
	let lock = SchedulerLock::new(None, &settings(60), "solo".to_string());
	let (_tx, mut rx) = watch::channel(false);
	assert!(!lock.is_guarded());
	assert!(lock.acquire(&mut rx).await);
	assert!(lock.renew().await.is_ok());
	lock.release().await;
}

#[test]
fn renew_interval_is_half_ttl_with_floor() {
	let store = Arc::new(MemoryLeaseStore::new());
	assert_eq!(lock(&store, "a", 60).renew_every(), Duration::from_secs(30));
	assert_eq!(lock(&store, "a", 6).renew_every(), Duration::from_secs(5));

	let short = lock(&store, "a", 3);
	assert_eq!(short.ttl(), Duration::from_secs(10));
	assert!(short.renew_every() * 2 <= short.ttl());
}

#[tokio::test(start_paused = true)]
async fn short_ttl_still_outlives_first_renewal() {
	let store = Arc::new(MemoryLeaseStore::new());
	let a = lock(&store, "host-a:1", 3);
	let b = Arc::new(lock(&store, "host-b:2", 3));
	let (_tx, rx) = watch::channel(false);

	assert!(a.acquire(&mut rx.clone()).await);
	let waiter = {
		let b = b.clone();
		let mut rx = rx.clone();
		tokio::spawn(async move { b.acquire(&mut rx).await })
	};

	tokio::time::sleep(a.renew_every()).await;
	assert!(!waiter.is_finished());
	assert!(a.renew().await.is_ok());

	tokio::time::sleep(Duration::from_secs(7)).await;
	assert!(!waiter.is_finished());
	assert_eq!(store.owner(a.key()).await.as_deref(), Some("host-a:1"));
	waiter.abort();
}

#[test]
fn owner_is_host_qualified_and_unique() {
	let a = crate::lock::process_owner();
	let b = crate::lock::process_owner();
	assert_ne!(a, b);
	assert!(a.contains(':'));
}
