#![forbid(unsafe_code)]

use std::time::Duration;

use dispatch_domain::{Identity, Role};
use proptest::prelude::*;

use crate::server::token::{InvalidToken, issue, issue_at, verify, verify_at};

const TTL: Duration = Duration::from_secs(600);
const T0: u64 = 1_700_000_000;

fn admin1() -> Identity {
	Identity {
		subject: "admin1".to_string(),
		role: Role::Admin,
	}
}

fn role_strategy() -> impl Strategy<Value = Role> {
	prop_oneof![
		Just(Role::Viewer),
		Just(Role::Editor),
		Just(Role::Admin),
		Just(Role::Superadmin),
	]
}

proptest! {
	#[test]
	fn valid_within_ttl_invalid_after(subject in "[a-zA-Z0-9_.@-]{1,32}", role in role_strategy(), age in 0u64..=600, extra in 1u64..10_000) {
		let identity = Identity { subject: subject.clone(), role };
		let token = issue_at("k1", &identity, T0);

		let claims = verify_at("k1", &token, TTL, T0 + age).unwrap();
		prop_assert_eq!(claims.sub, subject);
		prop_assert_eq!(claims.role, role);
		prop_assert_eq!(claims.iat, T0);

		prop_assert_eq!(verify_at("k1", &token, TTL, T0 + 600 + extra), Err(InvalidToken));
	}

	#[test]
	fn other_key_never_verifies(subject in "[a-z0-9]{1,16}", k2 in "[a-z0-9]{1,16}") {
		prop_assume!(k2 != "k1");
		let token = issue_at("k1", &Identity { subject, role: Role::Viewer }, T0);
		prop_assert_eq!(verify_at(&k2, &token, TTL, T0), Err(InvalidToken));
	}
}

#[test]
fn fresh_token_verifies_now() {
	let token = issue("secret", &admin1());
	let claims = verify("secret", &token, TTL).unwrap();
	assert_eq!(claims.sub, "admin1");
	assert_eq!(claims.role, Role::Admin);
}

#[test]
fn rejects_future_iat_beyond_skew() {
	let token = issue_at("k", &admin1(), T0 + 31);
	assert_eq!(verify_at("k", &token, TTL, T0), Err(InvalidToken));

	let token = issue_at("k", &admin1(), T0 + 30);
	assert!(verify_at("k", &token, TTL, T0).is_ok());
}

#[test]
fn rejects_tampering_and_garbage() {
	let token = issue_at("k", &admin1(), T0);
	let (head, sig) = token.rsplit_once('.').unwrap();

	let forged_payload = base64::Engine::encode(
		&base64::engine::general_purpose::URL_SAFE_NO_PAD,
		br#"{"sub":"root","role":"superadmin","v":1,"iat":1700000000}"#,
	);
	let forged = format!("v1.{forged_payload}.{sig}");
	assert_eq!(verify_at("k", &forged, TTL, T0), Err(InvalidToken));

	assert_eq!(verify_at("k", &format!("{head}.AAAA"), TTL, T0), Err(InvalidToken));
	assert_eq!(verify_at("k", "", TTL, T0), Err(InvalidToken));
	assert_eq!(verify_at("k", "v1.a.b.c", TTL, T0), Err(InvalidToken));
	assert_eq!(verify_at("k", &token.replacen("v1", "v2", 1), TTL, T0), Err(InvalidToken));
}

#[test]
fn rejects_truncated_or_flipped_signature() {
	let token = issue_at("k", &admin1(), T0);
	let (head, sig) = token.rsplit_once('.').unwrap();
	let raw = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, sig).unwrap();
	assert_eq!(raw.len(), 32);

	let encode = |bytes: &[u8]| base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes);

	let truncated = format!("{head}.{}", encode(&raw[..31]));
	assert_eq!(verify_at("k", &truncated, TTL, T0), Err(InvalidToken));

	let mut flipped = raw.clone();
	flipped[31] ^= 0x01;
	assert_eq!(verify_at("k", &format!("{head}.{}", encode(&flipped)), TTL, T0), Err(InvalidToken));

	let mut extended = raw;
	extended.push(0);
	assert_eq!(verify_at("k", &format!("{head}.{}", encode(&extended)), TTL, T0), Err(InvalidToken));

	assert!(verify_at("k", &token, TTL, T0).is_ok());
}
