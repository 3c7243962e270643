#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use dispatch_domain::{Identity, SecretString};
use dispatch_util::endpoint::hostname_of;
use dispatch_util::time::unix_now_secs;
use tracing::debug;

use crate::server::token;

pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// How long a rejected socket waits for the peer's close reply.
pub const CLOSE_HANDSHAKE_WAIT: Duration = Duration::from_secs(1);

const LOOPBACK_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Why a handshake was refused; sent to the client as a close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateRejection {
	pub code: u16,
	pub reason: &'static str,
}

impl GateRejection {
	pub const ORIGIN: Self = Self {
		code: CLOSE_POLICY_VIOLATION,
		reason: "Origin not allowed",
	};
	pub const NOT_CONFIGURED: Self = Self {
		code: CLOSE_INTERNAL_ERROR,
		reason: "Server not configured",
	};
	pub const UNAUTHORIZED: Self = Self {
		code: CLOSE_POLICY_VIOLATION,
		reason: "Unauthorized",
	};

	fn label(&self) -> &'static str {
		match (self.code, self.reason) {
			(CLOSE_INTERNAL_ERROR, _) => "not_configured",
			(_, "Origin not allowed") => "origin",
			_ => "unauthorized",
		}
	}
}

/// The handshake fields the gate looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeRequest<'a> {
	pub origin: Option<&'a str>,
	pub host: Option<&'a str>,
	/// Raw URI query, without the leading `?`.
	pub query: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct GateSettings {
	pub secret_key: Option<SecretString>,
	pub token_ttl: Duration,
	pub allowed_origins: Vec<String>,
}

/// Origin and token guard run before a socket joins a hub.
#[derive(Debug, Clone)]
pub struct ConnectionGate {
	settings: Arc<GateSettings>,
	bind_host: Option<String>,
}

impl ConnectionGate {
	pub fn new(settings: GateSettings) -> Self {
		Self {
			settings: Arc::new(settings),
			bind_host: None,
		}
	}

	/// Same gate, additionally treating `host` as a same-host origin.
	pub fn for_bind_host(&self, host: &str) -> Self {
		let host = hostname_of(host);
		let bind_host = (!host.is_empty() && host != "0.0.0.0" && host != "::").then_some(host);
		Self {
			settings: Arc::clone(&self.settings),
			bind_host,
		}
	}

	pub fn is_configured(&self) -> bool {
		self.settings.secret_key.is_some()
	}

	pub fn admit(&self, req: &HandshakeRequest<'_>) -> Result<Identity, GateRejection> {
		self.admit_at(req, unix_now_secs())
	}

	pub fn admit_at(&self, req: &HandshakeRequest<'_>, now: u64) -> Result<Identity, GateRejection> {
		let outcome = self.check(req, now);
		match &outcome {
			Ok(identity) => {
				metrics::counter!("dispatch_realtime_handshakes_total", "result" => "admitted").increment(1);
				debug!(%identity, "gate: admitted");
			}
			Err(rejection) => {
				metrics::counter!("dispatch_realtime_handshakes_total", "result" => rejection.label()).increment(1);
				debug!(code = rejection.code, reason = rejection.reason, origin = ?req.origin, "gate: rejected");
			}
		}
		outcome
	}

	fn check(&self, req: &HandshakeRequest<'_>, now: u64) -> Result<Identity, GateRejection> {
		if !self.origin_allowed(req.origin, req.host) {
			return Err(GateRejection::ORIGIN);
		}

		let Some(secret) = self.settings.secret_key.as_ref() else {
			return Err(GateRejection::NOT_CONFIGURED);
		};

		let token = req
			.query
			.and_then(token_from_query)
			.ok_or(GateRejection::UNAUTHORIZED)?;

		let claims = token::verify_at(secret.expose(), &token, self.settings.token_ttl, now)
			.map_err(|_| GateRejection::UNAUTHORIZED)?;

		Ok(Identity::from(claims))
	}

	fn origin_allowed(&self, origin: Option<&str>, host: Option<&str>) -> bool {
		// Non-browser clients send no Origin.
		let Some(origin) = origin.map(str::trim).filter(|o| !o.is_empty()) else {
			return true;
		};

		if !self.settings.allowed_origins.is_empty() {
			let origin = origin.trim_end_matches('/');
			return self
				.settings
				.allowed_origins
				.iter()
				.any(|allowed| allowed.trim_end_matches('/') == origin);
		}

		let Some(origin_host) = url::Url::parse(origin).ok().and_then(|u| {
			u.host_str()
				.map(|h| h.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase())
		}) else {
			return false;
		};

		if LOOPBACK_HOSTS.contains(&origin_host.as_str()) {
			return true;
		}
		if let Some(host) = host
			&& hostname_of(host) == origin_host
		{
			return true;
		}
		self.bind_host.as_deref() == Some(origin_host.as_str())
	}
}

fn token_from_query(query: &str) -> Option<String> {
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(k, _)| k == "token")
		.map(|(_, v)| v.trim().to_string())
		.filter(|v| !v.is_empty())
}
