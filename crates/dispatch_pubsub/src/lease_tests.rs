#![forbid(unsafe_code)]

use std::time::Duration;

use crate::lease::{LeaseStore, MemoryLeaseStore};

const KEY: &str = "dispatch:schedulers:lock";
const TTL: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn only_one_owner_until_ttl_lapses() {
	let store = MemoryLeaseStore::new();

	assert!(store.try_acquire(KEY, "a", TTL).await.unwrap());
	assert!(!store.try_acquire(KEY, "b", TTL).await.unwrap());

	tokio::time::advance(Duration::from_secs(59)).await;
	assert!(!store.try_acquire(KEY, "b", TTL).await.unwrap());

	tokio::time::advance(Duration::from_secs(2)).await;
	assert!(store.try_acquire(KEY, "b", TTL).await.unwrap());
	assert_eq!(store.owner(KEY).await.as_deref(), Some("b"));
}

#[tokio::test(start_paused = true)]
async fn renew_requires_matching_owner() {
	let store = MemoryLeaseStore::new();
	assert!(store.try_acquire(KEY, "a", TTL).await.unwrap());

	tokio::time::advance(Duration::from_secs(50)).await;
	assert!(store.try_renew(KEY, "a", TTL).await.unwrap());
	assert!(!store.try_renew(KEY, "b", TTL).await.unwrap());

	// Renewed at t=50, so still held at t=100.
	tokio::time::advance(Duration::from_secs(50)).await;
	assert!(!store.try_acquire(KEY, "b", TTL).await.unwrap());

	store.force_set(KEY, "b", TTL).await;
	assert!(!store.try_renew(KEY, "a", TTL).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn expired_lease_cannot_be_renewed() {
	let store = MemoryLeaseStore::new();
	assert!(store.try_acquire(KEY, "a", TTL).await.unwrap());
	tokio::time::advance(Duration::from_secs(61)).await;
	assert!(!store.try_renew(KEY, "a", TTL).await.unwrap());
}

#[tokio::test]
async fn release_is_owner_checked() {
	let store = MemoryLeaseStore::new();
	assert!(store.try_acquire(KEY, "a", TTL).await.unwrap());
	assert!(!store.release(KEY, "b").await.unwrap());
	assert!(store.release(KEY, "a").await.unwrap());
	assert!(store.try_acquire(KEY, "b", TTL).await.unwrap());
}
