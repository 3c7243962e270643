#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Liveness is unconditional; readiness tracks whether this worker currently leads.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
	leading: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_leading(&self, leading: bool) {
		self.leading.store(leading, Ordering::Relaxed);
	}

	pub fn is_leading(&self) -> bool {
		self.leading.load(Ordering::Relaxed)
	}
}

/// Bind now, serve in the background. Returns the bound address.
pub async fn spawn_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let local = listener.local_addr()?;
	info!(addr = %local, "worker health endpoint listening");

	tokio::spawn(async move {
		if let Err(err) = run_health_server(listener, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
	Ok(local)
}

async fn run_health_server(listener: TcpListener, state: HealthState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn reply(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, b""));
	}

	Ok(match req.uri().path() {
		"/healthz" => reply(StatusCode::OK, b"ok"),
		"/readyz" if state.is_leading() => reply(StatusCode::OK, b"ready"),
		"/readyz" => reply(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => reply(StatusCode::NOT_FOUND, b""),
	})
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
	use tokio::net::TcpStream;

	use super::*;

	async fn get(addr: SocketAddr, path: &str) -> String {
		let mut stream = TcpStream::connect(addr).await.unwrap();
		stream
			.write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").as_bytes())
			.await
			.unwrap();
		let mut out = String::new();
		stream.read_to_string(&mut out).await.unwrap();
		out
	}

	#[tokio::test]
	async fn readiness_follows_leadership() {
		let state = HealthState::new();
		let addr = spawn_health_server("127.0.0.1:0".parse().unwrap(), state.clone())
			.await
			.unwrap();

		assert!(get(addr, "/healthz").await.starts_with("HTTP/1.1 200"));
		assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));

		state.set_leading(true);
		let ready = get(addr, "/readyz").await;
		assert!(ready.starts_with("HTTP/1.1 200"));
		assert!(ready.ends_with("ready"));

		assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));
	}
}
