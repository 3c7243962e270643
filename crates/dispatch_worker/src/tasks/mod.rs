#![forbid(unsafe_code)]

//! Periodic jobs run by the worker while it holds the scheduler lock.
//!
//! Every job runs in one transaction against the relational store and publishes its
//! events through the broker only after commit.
//!
//! The queries go through the `Any` driver, which only carries integers, floats and text,
//! so the store follows `tasks/schema.sql` on both SQLite and Postgres: timestamps are
//! Unix seconds in BIGINT columns and flags are 0/1 integers. Native Postgres
//! `timestamp`/`boolean` columns are not read.

pub mod alerts;
pub mod duty;
pub mod retention;

use anyhow::Context as _;
use dispatch_domain::Envelope;
use dispatch_pubsub::EventBroker;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tracing::debug;


/// Store and broker shared by every task.
#[derive(Debug, Clone)]
pub struct TaskContext {
	pub pool: AnyPool,
	pub broker: EventBroker,
}

impl TaskContext {
	pub fn new(pool: AnyPool, broker: EventBroker) -> Self {
		Self { pool, broker }
	}

	/// Publish on the default channel. The worker has no local clients, so a failed
	/// publish is only logged.
	pub async fn publish_all(&self, events: Vec<Envelope>) -> usize {
		let mut published = 0;
		for envelope in events {
			if self.broker.publish(self.broker.channel(), &envelope).await {
				published += 1;
			} else {
				debug!(event = %envelope.event, "event not published; broker unavailable");
			}
		}
		published
	}
}

/// Connect to Postgres or SQLite through the `Any` driver.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<AnyPool> {
	sqlx::any::install_default_drivers();
	AnyPoolOptions::new()
		.max_connections(max_connections.max(1))
		.connect(database_url)
		.await
		.context("connect database")
}

pub(crate) fn now_secs() -> i64 {
	dispatch_util::time::unix_now_secs() as i64
}
