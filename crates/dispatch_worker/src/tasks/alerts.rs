#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use dispatch_domain::Envelope;
use serde_json::{Value, json};
use sqlx::{Any, Transaction};
use tracing::{debug, info};

use crate::config::AlertThresholds;
use crate::runner::PeriodicTask;
use crate::tasks::{TaskContext, now_secs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
	StalePoints,
	StaleHealth,
	BatteryLow,
	QueueGrowing,
	GpsOff,
	NetOffline,
	LowAccuracy,
	AppError,
	TrackingOff,
}

impl AlertKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			AlertKind::StalePoints => "stale_points",
			AlertKind::StaleHealth => "stale_health",
			AlertKind::BatteryLow => "battery_low",
			AlertKind::QueueGrowing => "queue_growing",
			AlertKind::GpsOff => "gps_off",
			AlertKind::NetOffline => "net_offline",
			AlertKind::LowAccuracy => "low_accuracy",
			AlertKind::AppError => "app_error",
			AlertKind::TrackingOff => "tracking_off",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertAction {
	Created,
	Updated,
	Closed,
}

impl AlertAction {
	pub const fn as_str(self) -> &'static str {
		match self {
			AlertAction::Created => "created",
			AlertAction::Updated => "updated",
			AlertAction::Closed => "closed",
		}
	}
}

/// Alert state a device should currently have for one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredAlert {
	pub severity: &'static str,
	pub message: String,
	pub payload: Value,
}

/// Latest health report of a device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceHealth {
	pub updated_at: Option<i64>,
	pub battery_pct: Option<i64>,
	pub is_charging: Option<bool>,
	pub net: Option<String>,
	pub gps: Option<String>,
	pub accuracy_m: Option<f64>,
	pub queue_size: Option<i64>,
	pub tracking_on: Option<bool>,
	pub last_error: Option<String>,
}

const APP_ERROR_MESSAGE_CHARS: usize = 140;

fn age_alert(now: i64, ts: i64, threshold: i64) -> Option<(&'static str, i64)> {
	let age = now - ts;
	if age <= threshold {
		return None;
	}
	Some((if age < 2 * threshold { "warn" } else { "crit" }, age))
}

/// Stale when the last point is older than the threshold; `crit` from twice the threshold.
pub fn evaluate_stale_points(now: i64, last_point_ts: Option<i64>, t: &AlertThresholds) -> Option<DesiredAlert> {
	let ts = last_point_ts?;
	let (severity, age) = age_alert(now, ts, t.stale_points_secs)?;

	Some(DesiredAlert {
		severity,
		message: format!("no points for {} min", age / 60),
		payload: json!({ "last_point_ts": ts }),
	})
}

/// Same rule as stale points, applied to the last health report.
pub fn evaluate_stale_health(now: i64, last_health_ts: Option<i64>, t: &AlertThresholds) -> Option<DesiredAlert> {
	let ts = last_health_ts?;
	let (severity, age) = age_alert(now, ts, t.stale_health_secs)?;

	Some(DesiredAlert {
		severity,
		message: format!("no health for {} min", age / 60),
		payload: json!({ "last_health_ts": ts }),
	})
}

/// Low battery while not charging.
pub fn evaluate_battery(health: &DeviceHealth, t: &AlertThresholds) -> Option<DesiredAlert> {
	let pct = health.battery_pct?;
	if health.is_charging == Some(true) {
		return None;
	}

	let severity = if pct <= t.battery_crit {
		"crit"
	} else if pct <= t.battery_low {
		"warn"
	} else {
		return None;
	};

	Some(DesiredAlert {
		severity,
		message: format!("battery {pct}%"),
		payload: json!({ "battery_pct": pct, "is_charging": health.is_charging }),
	})
}

/// Upload queue backing up on the device.
pub fn evaluate_queue(health: &DeviceHealth, t: &AlertThresholds) -> Option<DesiredAlert> {
	let size = health.queue_size?;
	let severity = if size >= t.queue_crit {
		"crit"
	} else if size >= t.queue_warn {
		"warn"
	} else {
		return None;
	};

	Some(DesiredAlert {
		severity,
		message: format!("queue {size}"),
		payload: json!({ "queue_size": size }),
	})
}

fn normalized(v: Option<&str>) -> String {
	v.unwrap_or_default().trim().to_lowercase()
}

/// Location switched off (`warn`) or permission denied (`crit`).
pub fn evaluate_gps(health: &DeviceHealth) -> Option<DesiredAlert> {
	let gps = normalized(health.gps.as_deref());
	let severity = match gps.as_str() {
		"denied" => "crit",
		"off" => "warn",
		_ => return None,
	};

	Some(DesiredAlert {
		severity,
		message: format!("GPS: {gps}"),
		payload: json!({ "gps": gps }),
	})
}

/// No network; `crit` while tracking is on.
pub fn evaluate_network(health: &DeviceHealth) -> Option<DesiredAlert> {
	let net = normalized(health.net.as_deref());
	if net != "none" && net != "offline" {
		return None;
	}

	Some(DesiredAlert {
		severity: if health.tracking_on == Some(true) { "crit" } else { "warn" },
		message: format!("network: {net}"),
		payload: json!({ "net": net, "tracking_on": health.tracking_on }),
	})
}

/// Poor fix accuracy, only while tracking is on.
pub fn evaluate_accuracy(health: &DeviceHealth, t: &AlertThresholds) -> Option<DesiredAlert> {
	if health.tracking_on != Some(true) {
		return None;
	}
	let acc = health.accuracy_m.filter(|a| a.is_finite())?;

	let severity = if acc >= t.accuracy_crit_m as f64 {
		"crit"
	} else if acc >= t.accuracy_warn_m as f64 {
		"warn"
	} else {
		return None;
	};

	Some(DesiredAlert {
		severity,
		message: format!("accuracy {} m", acc as i64),
		payload: json!({ "accuracy_m": acc, "warn_m": t.accuracy_warn_m, "crit_m": t.accuracy_crit_m }),
	})
}

/// Last error reported by the app; auth failures are `crit`.
pub fn evaluate_app_error(health: &DeviceHealth) -> Option<DesiredAlert> {
	let err = health.last_error.as_deref().map(str::trim).filter(|e| !e.is_empty())?;
	let low = err.to_lowercase();
	let severity = if low.contains("401") || low.contains("403") || low.contains("unauthor") {
		"crit"
	} else {
		"warn"
	};

	let short = if err.chars().count() <= APP_ERROR_MESSAGE_CHARS {
		err.to_string()
	} else {
		let mut s: String = err.chars().take(APP_ERROR_MESSAGE_CHARS).collect();
		s.push('…');
		s
	};

	Some(DesiredAlert {
		severity,
		message: format!("error: {short}"),
		payload: json!({ "last_error": err }),
	})
}

/// Tracking explicitly off while the user has an open shift.
pub fn evaluate_tracking_off(health: &DeviceHealth, active_shift: Option<i64>) -> Option<DesiredAlert> {
	let shift_id = active_shift?;
	if health.tracking_on != Some(false) {
		return None;
	}

	Some(DesiredAlert {
		severity: "warn",
		message: "tracking off during shift".to_string(),
		payload: json!({ "tracking_on": false, "shift_id": shift_id }),
	})
}

/// Opens, updates and auto-closes tracker alerts.
#[derive(Debug, Clone)]
pub struct AlertEvaluation {
	ctx: TaskContext,
	interval: Duration,
	thresholds: AlertThresholds,
}

struct Device {
	public_id: String,
	user_id: String,
}

impl AlertEvaluation {
	pub fn new(ctx: TaskContext, interval: Duration, thresholds: AlertThresholds) -> Self {
		Self {
			ctx,
			interval,
			thresholds,
		}
	}

	/// One pass at `now`; returns the `tracker_alert` events to publish.
	pub async fn run_at(&self, now: i64) -> anyhow::Result<Vec<Envelope>> {
		let mut tx = self.ctx.pool.begin().await.context("begin alerts tx")?;

		let devices: Vec<(String, String)> =
			sqlx::query_as("SELECT public_id, user_id FROM tracker_devices ORDER BY created_at DESC")
				.fetch_all(&mut *tx)
				.await
				.context("select tracker devices")?;

		let mut events = Vec::new();
		for (public_id, user_id) in devices {
			let device = Device { public_id, user_id };

			let last_point = last_point_ts(&mut tx, &device.user_id).await?;
			let stale = evaluate_stale_points(now, last_point, &self.thresholds);
			if let Some(ev) = apply(&mut tx, &device, AlertKind::StalePoints, stale, now).await? {
				events.push(ev);
			}

			let health = device_health(&mut tx, &device.public_id).await?;
			let last_health = health.as_ref().and_then(|h| h.updated_at);
			let stale = evaluate_stale_health(now, last_health, &self.thresholds);
			if let Some(ev) = apply(&mut tx, &device, AlertKind::StaleHealth, stale, now).await? {
				events.push(ev);
			}

			// The remaining kinds describe the health report itself; without one, open
			// alerts stay as they are.
			let Some(health) = health else {
				continue;
			};
			let shift = active_shift(&mut tx, &device.user_id).await?;
			let t = &self.thresholds;
			let desired = [
				(AlertKind::BatteryLow, evaluate_battery(&health, t)),
				(AlertKind::QueueGrowing, evaluate_queue(&health, t)),
				(AlertKind::GpsOff, evaluate_gps(&health)),
				(AlertKind::NetOffline, evaluate_network(&health)),
				(AlertKind::LowAccuracy, evaluate_accuracy(&health, t)),
				(AlertKind::AppError, evaluate_app_error(&health)),
				(AlertKind::TrackingOff, evaluate_tracking_off(&health, shift)),
			];
			for (kind, alert) in desired {
				if let Some(ev) = apply(&mut tx, &device, kind, alert, now).await? {
					events.push(ev);
				}
			}
		}

		tx.commit().await.context("commit alerts tx")?;

		if !events.is_empty() {
			info!(changes = events.len(), "tracker alerts changed");
		}
		Ok(events)
	}
}

#[async_trait]
impl PeriodicTask for AlertEvaluation {
	fn name(&self) -> &'static str {
		"alert_evaluation"
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

/// Prefer the open session's `last_at`, else the newest point of any session.
async fn last_point_ts(tx: &mut Transaction<'static, Any>, user_id: &str) -> anyhow::Result<Option<i64>> {
	let open: Option<(Option<i64>,)> = sqlx::query_as(
		"SELECT last_at FROM tracking_sessions WHERE user_id = $1 AND ended_at IS NULL \
		ORDER BY started_at DESC LIMIT 1",
	)
	.bind(user_id)
	.fetch_optional(&mut **tx)
	.await
	.context("select open tracking session")?;

	if let Some((Some(ts),)) = open {
		return Ok(Some(ts));
	}

	let newest: Option<(Option<i64>,)> = sqlx::query_as(
		"SELECT MAX(p.ts) FROM tracking_points p JOIN tracking_sessions s ON p.session_id = s.id \
		WHERE s.user_id = $1",
	)
	.bind(user_id)
	.fetch_optional(&mut **tx)
	.await
	.context("select newest tracking point")?;

	Ok(newest.and_then(|(ts,)| ts))
}

type HealthRow = (
	Option<i64>,
	Option<i64>,
	Option<i64>,
	Option<String>,
	Option<String>,
	Option<f64>,
	Option<i64>,
	Option<i64>,
	Option<String>,
);

async fn device_health(tx: &mut Transaction<'static, Any>, device_id: &str) -> anyhow::Result<Option<DeviceHealth>> {
	let row: Option<HealthRow> = sqlx::query_as(
		"SELECT updated_at, battery_pct, is_charging, net, gps, accuracy_m, queue_size, tracking_on, last_error \
		FROM tracker_device_health WHERE device_id = $1",
	)
	.bind(device_id)
	.fetch_optional(&mut **tx)
	.await
	.context("select device health")?;

	Ok(row.map(
		|(updated_at, battery_pct, is_charging, net, gps, accuracy_m, queue_size, tracking_on, last_error)| DeviceHealth {
			updated_at,
			battery_pct,
			is_charging: is_charging.map(|v| v != 0),
			net,
			gps,
			accuracy_m,
			queue_size,
			tracking_on: tracking_on.map(|v| v != 0),
			last_error,
		},
	))
}

async fn active_shift(tx: &mut Transaction<'static, Any>, user_id: &str) -> anyhow::Result<Option<i64>> {
	let row: Option<(i64,)> =
		sqlx::query_as("SELECT id FROM duty_shifts WHERE user_id = $1 AND ended_at IS NULL ORDER BY started_at DESC LIMIT 1")
			.bind(user_id)
			.fetch_optional(&mut **tx)
			.await
			.context("select active shift")?;
	Ok(row.map(|(id,)| id))
}

/// Reconcile the stored alert with `desired`, writing only on change.
async fn apply(
	tx: &mut Transaction<'static, Any>,
	device: &Device,
	kind: AlertKind,
	desired: Option<DesiredAlert>,
	now: i64,
) -> anyhow::Result<Option<Envelope>> {
	let Some(desired) = desired else {
		let closed = sqlx::query(
			"UPDATE tracker_alerts SET is_active = 0, closed_at = $1, closed_by = 'auto', updated_at = $1 \
			WHERE device_id = $2 AND user_id = $3 AND kind = $4 AND is_active = 1",
		)
		.bind(now)
		.bind(device.public_id.clone())
		.bind(device.user_id.clone())
		.bind(kind.as_str())
		.execute(&mut **tx)
		.await
		.context("close alert")?;

		if closed.rows_affected() == 0 {
			return Ok(None);
		}
		return Ok(Some(alert_event(AlertAction::Closed, kind, device, None)));
	};

	let payload_json = desired.payload.to_string();
	let active: Option<(i64, String, String, Option<String>)> = sqlx::query_as(
		"SELECT id, severity, message, payload_json FROM tracker_alerts \
		WHERE device_id = $1 AND user_id = $2 AND kind = $3 AND is_active = 1 \
		ORDER BY created_at DESC LIMIT 1",
	)
	.bind(device.public_id.clone())
	.bind(device.user_id.clone())
	.bind(kind.as_str())
	.fetch_optional(&mut **tx)
	.await
	.context("select active alert")?;

	let action = match active {
		None => {
			sqlx::query(
				"INSERT INTO tracker_alerts \
				(device_id, user_id, kind, severity, message, payload_json, created_at, updated_at, is_active) \
				VALUES ($1, $2, $3, $4, $5, $6, $7, $7, 1)",
			)
			.bind(device.public_id.clone())
			.bind(device.user_id.clone())
			.bind(kind.as_str())
			.bind(desired.severity)
			.bind(desired.message.clone())
			.bind(payload_json)
			.bind(now)
			.execute(&mut **tx)
			.await
			.context("insert alert")?;
			AlertAction::Created
		}
		Some((id, severity, message, stored_payload)) => {
			let unchanged = severity == desired.severity
				&& message == desired.message
				&& stored_payload.as_deref() == Some(payload_json.as_str());
			if unchanged {
				return Ok(None);
			}

			sqlx::query(
				"UPDATE tracker_alerts SET severity = $1, message = $2, payload_json = $3, updated_at = $4 \
				WHERE id = $5",
			)
			.bind(desired.severity)
			.bind(desired.message.clone())
			.bind(payload_json)
			.bind(now)
			.bind(id)
			.execute(&mut **tx)
			.await
			.context("update alert")?;
			AlertAction::Updated
		}
	};

	debug!(device = %device.public_id, kind = kind.as_str(), action = action.as_str(), "alert reconciled");
	Ok(Some(alert_event(action, kind, device, Some(&desired))))
}

fn alert_event(action: AlertAction, kind: AlertKind, device: &Device, desired: Option<&DesiredAlert>) -> Envelope {
	Envelope::with_value(
		"tracker_alert",
		json!({
			"action": action.as_str(),
			"kind": kind.as_str(),
			"device_id": device.public_id,
			"user_id": device.user_id,
			"severity": desired.map(|d| d.severity),
			"message": desired.map(|d| d.message.as_str()),
		}),
	)
}
