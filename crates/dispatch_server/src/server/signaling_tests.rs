#![forbid(unsafe_code)]

use dispatch_domain::{Envelope, Identity, Role};
use serde_json::json;
use tokio::sync::mpsc;

use crate::server::registry::{ClientRegistration, ClientRegistry, Outbound};
use crate::server::signaling::relay;

async fn join(registry: &ClientRegistry, subject: &str) -> (ClientRegistration, mpsc::Receiver<Outbound>) {
	let (reg, rx) = ClientRegistration::new(
		Identity {
			subject: subject.to_string(),
			role: Role::Viewer,
		},
		8,
	);
	registry.register(reg.clone()).await;
	(reg, rx)
}

fn next(rx: &mut mpsc::Receiver<Outbound>) -> Envelope {
	let raw = rx.try_recv().expect("frame queued");
	Envelope::from_json(&raw).unwrap()
}

#[tokio::test]
async fn offer_answer_and_candidates_are_routed() {
	let registry = ClientRegistry::new("test");
	let (admin, mut admin_rx) = join(&registry, "admin1").await;
	let (_phone, mut phone_rx) = join(&registry, "42").await;
	let (_other, mut other_rx) = join(&registry, "7").await;

	let offer = json!({"event": "webrtc_offer", "data": {"target_user_id": 42, "sdp": "v=0"}}).to_string();
	assert_eq!(relay(&registry, admin.session, &offer).await, 1);
	let got = next(&mut phone_rx);
	assert_eq!(got.event, "webrtc_offer");
	assert_eq!(got.data.get("sdp"), Some(&json!("v=0")));
	let caller_sid = got.data.get("caller_sid").and_then(|v| v.as_str()).unwrap().to_string();
	assert_eq!(caller_sid, admin.session.to_string());

	let answer = json!({"event": "webrtc_answer", "data": {"caller_sid": caller_sid, "sdp": "answer"}}).to_string();
	assert_eq!(relay(&registry, admin.session, &answer).await, 1);
	let got = next(&mut admin_rx);
	assert_eq!(got.event, "webrtc_answer");
	assert_eq!(got.data.get("sdp"), Some(&json!("answer")));

	let ice = json!({"event": "webrtc_ice_candidate", "data": {"target_user_id": "42", "candidate": "c1"}}).to_string();
	assert_eq!(relay(&registry, admin.session, &ice).await, 1);
	assert_eq!(next(&mut phone_rx).data.get("candidate"), Some(&json!("c1")));

	assert!(other_rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_and_garbage_frames_are_ignored() {
	let registry = ClientRegistry::new("test");
	let (a, mut a_rx) = join(&registry, "a").await;

	assert_eq!(relay(&registry, a.session, "hello").await, 0);
	assert_eq!(relay(&registry, a.session, r#"{"event":"chat","data":{}}"#).await, 0);
	assert_eq!(
		relay(&registry, a.session, r#"{"event":"webrtc_answer","data":{"caller_sid":"nope"}}"#).await,
		0
	);
	assert!(a_rx.try_recv().is_err());
}
