#![forbid(unsafe_code)]

use std::sync::Arc;

use dispatch_domain::{Envelope, SessionId};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::server::registry::{ClientRegistry, Outbound};

/// Route one inbound client frame. Only WebRTC call-setup frames are relayed; anything
/// else (including non-JSON) is ignored. Returns the number of connections reached.
pub async fn relay(registry: &ClientRegistry, from: SessionId, raw: &str) -> usize {
	let Ok(Value::Object(msg)) = serde_json::from_str::<Value>(raw) else {
		return 0;
	};

	let event = msg.get("event").and_then(Value::as_str).unwrap_or_default();
	let empty = Map::new();
	let data = msg.get("data").and_then(Value::as_object).unwrap_or(&empty);

	let delivered = match event {
		"webrtc_offer" => {
			let target_user = id_string(data.get("target_user_id"));
			if target_user.is_empty() {
				return 0;
			}
			let out = frame(
				event,
				json!({
					"sdp": data.get("sdp").cloned().unwrap_or(Value::Null),
					"caller_sid": from.to_string(),
				}),
			);
			registry
				.send_where(&out, |reg| reg.identity.subject == target_user)
				.await
		}
		"webrtc_answer" => {
			let Ok(caller) = id_string(data.get("caller_sid")).parse::<SessionId>() else {
				return 0;
			};
			let out = frame(event, json!({ "sdp": data.get("sdp").cloned().unwrap_or(Value::Null) }));
			registry.send_where(&out, |reg| reg.session == caller).await
		}
		"webrtc_ice_candidate" => {
			let target_sid = id_string(data.get("target_sid")).parse::<SessionId>().ok();
			let target_user = id_string(data.get("target_user_id"));
			if target_sid.is_none() && target_user.is_empty() {
				return 0;
			}
			let out = frame(
				event,
				json!({ "candidate": data.get("candidate").cloned().unwrap_or(Value::Null) }),
			);
			registry
				.send_where(&out, |reg| {
					target_sid == Some(reg.session) || (!target_user.is_empty() && reg.identity.subject == target_user)
				})
				.await
		}
		_ => return 0,
	};

	metrics::counter!("dispatch_realtime_signaling_relayed_total", "event" => event.to_string()).increment(1);
	debug!(%event, %from, delivered, "signaling relayed");
	delivered
}

fn frame(event: &str, data: Value) -> Outbound {
	Arc::from(Envelope::with_value(event, data).to_json())
}

fn id_string(v: Option<&Value>) -> String {
	match v {
		Some(Value::String(s)) => s.trim().to_string(),
		Some(Value::Number(n)) => n.to_string(),
		_ => String::new(),
	}
}
