#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dispatch_domain::{Identity, TOKEN_CLAIMS_VERSION, TokenClaims};
use dispatch_util::time::unix_now_secs;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

/// Namespaces the MAC so tokens minted for other purposes with the same key never verify.
const TOKEN_SALT: &[u8] = b"dispatch-realtime";

/// Tolerated clock skew for tokens issued "in the future".
const MAX_FUTURE_SKEW_SECS: u64 = 30;

/// Single error for every verification failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid token")]
pub struct InvalidToken;

/// Mint a `v1.<payload>.<sig>` token for `identity`, issued now.
pub fn issue(secret: &str, identity: &Identity) -> String {
	issue_at(secret, identity, unix_now_secs())
}

pub fn issue_at(secret: &str, identity: &Identity, iat: u64) -> String {
	let claims = TokenClaims {
		sub: identity.subject.clone(),
		role: identity.role,
		v: TOKEN_CLAIMS_VERSION,
		iat,
	};
	// Serializing plain strings/ints into a Vec cannot fail.
	let payload = serde_json::to_vec(&claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = token_mac(payload_b64.as_bytes(), secret.as_bytes()).finalize().into_bytes();
	let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
	format!("v1.{payload_b64}.{sig_b64}")
}

/// Check signature and age (`now - iat <= max_age`).
pub fn verify(secret: &str, token: &str, max_age: Duration) -> Result<TokenClaims, InvalidToken> {
	verify_at(secret, token, max_age, unix_now_secs())
}

pub fn verify_at(secret: &str, token: &str, max_age: Duration, now: u64) -> Result<TokenClaims, InvalidToken> {
	let mut parts = token.trim().split('.');
	let (Some("v1"), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(InvalidToken);
	};

	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| InvalidToken)?;
	token_mac(payload_b64.as_bytes(), secret.as_bytes())
		.verify_slice(&provided_sig)
		.map_err(|_| InvalidToken)?;

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| InvalidToken)?;
	let claims: TokenClaims = serde_json::from_slice(&payload).map_err(|_| InvalidToken)?;
	if claims.v != TOKEN_CLAIMS_VERSION || claims.sub.is_empty() {
		return Err(InvalidToken);
	}

	if claims.iat > now.saturating_add(MAX_FUTURE_SKEW_SECS) {
		return Err(InvalidToken);
	}
	if now.saturating_sub(claims.iat) > max_age.as_secs() {
		return Err(InvalidToken);
	}

	Ok(claims)
}

/// HMAC-SHA256 over the salt and the encoded payload. Verification goes through
/// `Mac::verify_slice`, which compares in constant time.
fn token_mac(payload_b64: &[u8], secret: &[u8]) -> Hmac<Sha256> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(TOKEN_SALT);
	mac.update(b".");
	mac.update(payload_b64);
	mac
}
