#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use dispatch_domain::Envelope;
use serde_json::json;
use tracing::info;

use crate::runner::PeriodicTask;
use crate::tasks::{TaskContext, now_secs};

const BREAK_DUE_TEXT: &str = "Break time is over. Wait for the operator to confirm.";

/// Marks started breaks whose end time passed and announces them once: a `BREAK_DUE`
/// duty event, a notification row for the user's client to pick up, and a `break_due`
/// broadcast.
#[derive(Debug, Clone)]
pub struct DutyBookkeeping {
	ctx: TaskContext,
	interval: Duration,
}

impl DutyBookkeeping {
	pub fn new(ctx: TaskContext, interval: Duration) -> Self {
		Self { ctx, interval }
	}

	/// One pass at `now`; returns the `break_due` events to publish.
	pub async fn run_at(&self, now: i64) -> anyhow::Result<Vec<Envelope>> {
		let mut tx = self.ctx.pool.begin().await.context("begin duty tx")?;

		let due: Vec<(i64, String, Option<i64>)> = sqlx::query_as(
			"SELECT id, user_id, shift_id FROM break_requests \
			WHERE status = 'started' AND due_notified = 0 AND ends_at IS NOT NULL AND ends_at <= $1 \
			ORDER BY ends_at",
		)
		.bind(now)
		.fetch_all(&mut *tx)
		.await
		.context("select due breaks")?;

		let mut events = Vec::with_capacity(due.len());
		for (break_id, user_id, shift_id) in due {
			let updated = sqlx::query("UPDATE break_requests SET due_notified = 1 WHERE id = $1 AND due_notified = 0")
				.bind(break_id)
				.execute(&mut *tx)
				.await
				.context("mark break notified")?;
			if updated.rows_affected() == 0 {
				continue;
			}

			sqlx::query(
				"INSERT INTO duty_events (user_id, shift_id, event_type, actor, payload_json, ts) \
				VALUES ($1, $2, 'BREAK_DUE', 'system', $3, $4)",
			)
			.bind(user_id.clone())
			.bind(shift_id)
			.bind(json!({ "break_id": break_id }).to_string())
			.bind(now)
			.execute(&mut *tx)
			.await
			.context("append BREAK_DUE")?;

			let payload = json!({ "break_id": break_id }).to_string();
			sqlx::query(
				"INSERT INTO duty_notifications (user_id, created_at, kind, text, payload_json, acked) \
				VALUES ($1, $2, 'break_due', $3, $4, 0)",
			)
			.bind(user_id.clone())
			.bind(now)
			.bind(BREAK_DUE_TEXT)
			.bind(payload)
			.execute(&mut *tx)
			.await
			.context("queue break notification")?;

			events.push(Envelope::with_value(
				"break_due",
				json!({ "user_id": user_id, "shift_id": shift_id, "break_id": break_id }),
			));
		}

		tx.commit().await.context("commit duty tx")?;

		if !events.is_empty() {
			info!(count = events.len(), "breaks due");
		}
		Ok(events)
	}
}

#[async_trait]
impl PeriodicTask for DutyBookkeeping {
	fn name(&self) -> &'static str {
		"duty_bookkeeping"
	}

	fn interval(&self) -> Duration {
		self.interval
	}

	async fn run(&self) -> anyhow::Result<()> {
		let events = self.run_at(now_secs()).await?;
		self.ctx.publish_all(events).await;
		Ok(())
	}
}
