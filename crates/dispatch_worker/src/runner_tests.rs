#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use dispatch_pubsub::{LeaseStore, MemoryLeaseStore};
use tokio::sync::watch;

use crate::config::SchedulerSettings;
use crate::lock::SchedulerLock;
use crate::runner::{PeriodicTask, TaskOutcome, TickRunner, run_task};

#[derive(Clone, Copy)]
enum Behaviour {
	Succeed,
	Fail,
	Panic,
}

struct Probe {
	name: &'static str,
	interval: Duration,
	behaviour: Behaviour,
	runs: Arc<AtomicUsize>,
}

impl Probe {
	fn new(name: &'static str, interval_secs: u64, behaviour: Behaviour) -> (Arc<Self>, Arc<AtomicUsize>) {
		let runs = Arc::new(AtomicUsize::new(0));
		let probe = Arc::new(Self {
			name,
			interval: Duration::from_secs(interval_secs),
			behaviour,
			runs: runs.clone(),
		});
		(probe, runs)
	}
}

#[async_trait]
impl PeriodicTask for Probe {
	fn name(&self) -> &'static str {
		self.name
	}

	fn interval(&self) -> Duration {
		self.interval
	}

	async fn run(&self) -> anyhow::Result<()> {
		self.runs.fetch_add(1, Ordering::SeqCst);
		match self.behaviour {
			Behaviour::Succeed => Ok(()),
			Behaviour::Fail => Err(anyhow!("boom")),
			Behaviour::Panic => panic!("probe panicked"),
		}
	}
}

async fn leading_lock(store: &Arc<MemoryLeaseStore>, ttl_secs: u64) -> Arc<SchedulerLock> {
	let settings = SchedulerSettings {
		lock_ttl: Duration::from_secs(ttl_secs),
		..SchedulerSettings::default()
	};
	let store: Arc<dyn LeaseStore> = store.clone();
	let lock = Arc::new(SchedulerLock::new(Some(store), &settings, "runner:1".to_string()));
	let (_tx, mut rx) = watch::channel(false);
	assert!(lock.acquire(&mut rx).await);
	lock
}

#[tokio::test(start_paused = true)]
async fn no_task_runs_after_detected_loss() {
	let store = Arc::new(MemoryLeaseStore::new());
	// renew_every = 5s; the probe is due at the same instants as the renewal.
	let lock = leading_lock(&store, 10).await;
	let (probe, runs) = Probe::new("probe", 5, Behaviour::Succeed);
	let (_tx, rx) = watch::channel(false);

	let runner = tokio::spawn(TickRunner::new(lock.clone()).with_task(probe).run(rx));

	tokio::time::sleep(Duration::from_secs(2)).await;
	assert_eq!(runs.load(Ordering::SeqCst), 1);
	store.force_set(lock.key(), "someone-else", Duration::from_secs(60)).await;

	let result = tokio::time::timeout(Duration::from_secs(10), runner)
		.await
		.expect("runner stops")
		.unwrap();
	assert!(result.is_err());
	assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_tasks_do_not_affect_siblings() {
	let store = Arc::new(MemoryLeaseStore::new());
	let lock = leading_lock(&store, 60).await;
	let (healthy, healthy_runs) = Probe::new("healthy", 1, Behaviour::Succeed);
	let (failing, failing_runs) = Probe::new("failing", 1, Behaviour::Fail);
	let (panicking, panicking_runs) = Probe::new("panicking", 1, Behaviour::Panic);
	let (tx, rx) = watch::channel(false);

	let runner = TickRunner::new(lock)
		.with_task(failing)
		.with_task(panicking)
		.with_task(healthy);
	let handle = tokio::spawn(runner.run(rx));

	tokio::time::sleep(Duration::from_millis(3500)).await;
	tx.send(true).unwrap();
	assert!(handle.await.unwrap().is_ok());

	let healthy = healthy_runs.load(Ordering::SeqCst);
	assert!(healthy >= 3, "healthy ran {healthy} times");
	assert_eq!(failing_runs.load(Ordering::SeqCst), healthy);
	assert_eq!(panicking_runs.load(Ordering::SeqCst), healthy);
}

#[tokio::test(start_paused = true)]
async fn renewal_keeps_leader_running() {
	let store = Arc::new(MemoryLeaseStore::new());
	let lock = leading_lock(&store, 10).await;
	let (probe, runs) = Probe::new("probe", 1, Behaviour::Succeed);
	let (tx, rx) = watch::channel(false);

	let handle = tokio::spawn(TickRunner::new(lock.clone()).with_task(probe).run(rx));

	tokio::time::sleep(Duration::from_secs(30)).await;
	assert_eq!(store.owner(lock.key()).await.as_deref(), Some("runner:1"));
	tx.send(true).unwrap();
	assert!(handle.await.unwrap().is_ok());
	assert!(runs.load(Ordering::SeqCst) >= 25);
}

#[tokio::test]
async fn run_task_reports_each_outcome() {
	let (ok, _) = Probe::new("ok", 1, Behaviour::Succeed);
	let (fail, _) = Probe::new("fail", 1, Behaviour::Fail);
	let (panic, _) = Probe::new("panic", 1, Behaviour::Panic);

	assert_eq!(run_task(ok.as_ref()).await, TaskOutcome::Ok);
	assert_eq!(run_task(fail.as_ref()).await, TaskOutcome::Failed);
	assert_eq!(run_task(panic.as_ref()).await, TaskOutcome::Panicked);
}
