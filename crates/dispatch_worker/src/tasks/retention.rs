#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tracing::info;

use crate::config::RetentionPolicy;
use crate::runner::PeriodicTask;
use crate::tasks::{TaskContext, now_secs};

const DAY_SECS: i64 = 24 * 3600;

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
	pub points_deleted: u64,
	pub health_log_deleted: u64,
}

/// Deletes old tracking points and device health history.
#[derive(Debug, Clone)]
pub struct RetentionSweep {
	ctx: TaskContext,
	interval: Duration,
	policy: RetentionPolicy,
}

impl RetentionSweep {
	pub fn new(ctx: TaskContext, interval: Duration, policy: RetentionPolicy) -> Self {
		Self { ctx, interval, policy }
	}

	pub async fn run_at(&self, now: i64) -> anyhow::Result<RetentionOutcome> {
		let points_cutoff = now - self.policy.effective_points_days() as i64 * DAY_SECS;
		let health_cutoff = now - self.policy.effective_health_log_days() as i64 * DAY_SECS;

		let mut tx = self.ctx.pool.begin().await.context("begin retention tx")?;

		let points = sqlx::query("DELETE FROM tracking_points WHERE ts < $1")
			.bind(points_cutoff)
			.execute(&mut *tx)
			.await
			.context("delete old tracking points")?;

		let health = sqlx::query("DELETE FROM tracker_device_health_log WHERE ts < $1")
			.bind(health_cutoff)
			.execute(&mut *tx)
			.await
			.context("delete old health log")?;

		tx.commit().await.context("commit retention tx")?;

		let outcome = RetentionOutcome {
			points_deleted: points.rows_affected(),
			health_log_deleted: health.rows_affected(),
		};
		info!(
			points = outcome.points_deleted,
			health_log = outcome.health_log_deleted,
			points_cutoff,
			health_cutoff,
			"retention sweep done"
		);
		Ok(outcome)
	}
}

#[async_trait]
impl PeriodicTask for RetentionSweep {
	fn name(&self) -> &'static str {
		"retention_sweep"
	}

	fn interval(&self) -> Duration {
		self.interval
	}

	async fn run(&self) -> anyhow::Result<()> {
		self.run_at(now_secs()).await.map(|_| ())
	}
}
