#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, RawQuery, State};
use axum::http::header::{HOST, ORIGIN};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use dispatch_domain::{Identity, Role, SecretString};
use dispatch_util::endpoint::hostname_of;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::server::embedded::{EmbeddedHub, reject_socket};
use crate::server::gate::{ConnectionGate, HandshakeRequest};
use crate::server::hub::RealtimeHub;
use crate::server::standalone::StandaloneHub;
use crate::server::token;

pub const ADMIN_USER_HEADER: &str = "x-admin-user";
pub const ADMIN_ROLE_HEADER: &str = "x-admin-role";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
	pub gate: ConnectionGate,
	pub secret_key: Option<SecretString>,
	pub token_ttl: Duration,
	pub ws_port: u16,
	pub disable_sameport: bool,
	pub embedded: Option<EmbeddedHub>,
	pub standalone: Option<Arc<StandaloneHub>>,
	pub ready: Arc<AtomicBool>,
}

impl AppState {
	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}
}

/// Administrator session asserted by the fronting session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSession {
	pub user: String,
	pub role: Role,
}

impl<S> FromRequestParts<S> for AdminSession
where
	S: Send + Sync,
{
	type Rejection = (StatusCode, Json<serde_json::Value>);

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		let forbidden = || (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" })));

		let user = header_str(&parts.headers, ADMIN_USER_HEADER)
			.map(str::trim)
			.filter(|u| !u.is_empty())
			.ok_or_else(forbidden)?
			.to_string();

		let role = match header_str(&parts.headers, ADMIN_ROLE_HEADER) {
			Some(raw) => raw.parse::<Role>().map_err(|_| forbidden())?,
			None => Role::Viewer,
		};

		Ok(Self { user, role })
	}
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
	pub token: String,
	pub expires_in: u64,
	pub ws_url_sameport: Option<String>,
	pub ws_url_port: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
	pub ws_clients: usize,
	pub embedded_clients: usize,
	pub standalone_clients: usize,
}

pub fn router(state: AppState) -> Router {
	let mut router = Router::new()
		.route("/realtime/token", get(realtime_token))
		.route("/realtime/stats", get(realtime_stats))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz));

	if state.embedded.is_some() {
		router = router.route("/ws", get(ws_upgrade));
	}

	router.with_state(state)
}

pub async fn realtime_token(State(state): State<AppState>, admin: AdminSession, headers: HeaderMap) -> Response {
	let Some(secret) = state.secret_key.as_ref() else {
		return (
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({ "error": "realtime signing key not configured" })),
		)
			.into_response();
	};

	let identity = Identity {
		subject: admin.user,
		role: admin.role,
	};
	let tok = token::issue(secret.expose(), &identity);
	metrics::counter!("dispatch_realtime_tokens_issued_total").increment(1);
	debug!(%identity, "issued realtime token");

	let forwarded_https = header_str(&headers, "x-forwarded-proto")
		.is_some_and(|p| p.split(',').next().is_some_and(|p| p.trim().eq_ignore_ascii_case("https")));
	let scheme = if forwarded_https { "wss" } else { "ws" };
	let host = header_str(&headers, HOST.as_str())
		.map(str::trim)
		.filter(|h| !h.is_empty())
		.unwrap_or("localhost");

	let ws_url_sameport = (state.embedded.is_some() && !state.disable_sameport)
		.then(|| format!("{scheme}://{host}/ws?token={tok}"));

	let ws_url_port = state.standalone.as_ref().map(|_| {
		let hostname = hostname_of(host);
		let hostname = if hostname.contains(':') {
			format!("[{hostname}]")
		} else {
			hostname
		};
		format!("{scheme}://{hostname}:{}/ws?token={tok}", state.ws_port)
	});

	Json(TokenResponse {
		token: tok,
		expires_in: state.token_ttl.as_secs(),
		ws_url_sameport,
		ws_url_port,
	})
	.into_response()
}

pub async fn realtime_stats(State(state): State<AppState>, _admin: AdminSession) -> Json<StatsResponse> {
	let embedded_clients = state.embedded.as_ref().map_or(0, |h| h.client_count());
	let standalone_clients = state.standalone.as_ref().map_or(0, |h| h.client_count());
	Json(StatsResponse {
		ws_clients: embedded_clients + standalone_clients,
		embedded_clients,
		standalone_clients,
	})
}

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz(State(state): State<AppState>) -> Response {
	if state.ready.load(Ordering::Relaxed) {
		(StatusCode::OK, "ready").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
	}
}

async fn ws_upgrade(
	State(state): State<AppState>,
	headers: HeaderMap,
	RawQuery(query): RawQuery,
	ws: WebSocketUpgrade,
) -> Response {
	let Some(hub) = state.embedded.clone() else {
		return StatusCode::NOT_FOUND.into_response();
	};

	let req = HandshakeRequest {
		origin: header_str(&headers, ORIGIN.as_str()),
		host: header_str(&headers, HOST.as_str()),
		query: query.as_deref(),
	};

	match state.gate.admit(&req) {
		Ok(identity) => {
			info!(%identity, "embedded socket admitted");
			ws.on_upgrade(move |socket| async move { hub.serve_socket(socket, identity).await })
		}
		Err(rejection) => ws.on_upgrade(move |socket| reject_socket(socket, rejection)),
	}
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers.get(name).and_then(|v| v.to_str().ok())
}
