#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	use thiserror::Error;

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointError {
		#[error("endpoint must be non-empty (expected host:port)")]
		Empty,
		#[error("invalid endpoint (expected host:port without path/query/fragment): {0}")]
		Path(String),
		#[error("invalid endpoint (missing :port, expected host:port): {0}")]
		MissingPort(String),
		#[error("invalid endpoint host (expected host:port): {0}")]
		EmptyHost(String),
		#[error("invalid endpoint host (IPv6 must be bracketed like [::1]:8765): {0}")]
		UnbracketedIpv6(String),
		#[error("invalid endpoint port (expected 1..=65535): {0}")]
		Port(String),
		#[error("host must be an IP literal (DNS names not supported here): {0}")]
		NotIpLiteral(String),
	}

	/// Parsed `host:port` listen endpoint. An optional `ws://`, `tcp://` or `http://`
	/// prefix is accepted and ignored.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct BindEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl BindEndpoint {
		pub fn new(host: impl Into<String>, port: u16) -> Self {
			Self {
				host: host.into(),
				port,
			}
		}

		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointError> {
			self.hostport()
				.parse()
				.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
		}

		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointError::Empty);
			}

			let rest = ["ws://", "tcp://", "http://"]
				.iter()
				.find_map(|p| s.strip_prefix(p))
				.unwrap_or(s);

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(EndpointError::Path(s.to_string()));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(EndpointError::EmptyHost(s.to_string()));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointError::UnbracketedIpv6(s.to_string()));
			}

			let port: u16 = port_str.trim().parse().map_err(|_| EndpointError::Port(s.to_string()))?;
			if port == 0 {
				return Err(EndpointError::Port(s.to_string()));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	impl std::fmt::Display for BindEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "{}:{}", self.host, self.port)
		}
	}

	/// Hostname part of an HTTP `Host` header or origin authority, lowercased.
	pub fn hostname_of(authority: &str) -> String {
		let authority = authority.trim();
		let host = if let Some(rest) = authority.strip_prefix('[') {
			rest.split(']').next().unwrap_or_default()
		} else {
			authority.split(':').next().unwrap_or_default()
		};
		host.to_ascii_lowercase()
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_plain_and_prefixed() {
			let e = BindEndpoint::parse("0.0.0.0:8765").unwrap();
			assert_eq!(e.host, "0.0.0.0");
			assert_eq!(e.port, 8765);

			let e = BindEndpoint::parse("ws://dispatch.example.com:443").unwrap();
			assert_eq!(e.hostport(), "dispatch.example.com:443");
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = BindEndpoint::parse("[::1]:8765").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:8765");
		}

		#[test]
		fn rejects_bad_forms() {
			assert_eq!(BindEndpoint::parse(" "), Err(EndpointError::Empty));
			assert!(matches!(BindEndpoint::parse("::1:80"), Err(EndpointError::UnbracketedIpv6(_))));
			assert!(matches!(BindEndpoint::parse("127.0.0.1:0"), Err(EndpointError::Port(_))));
			assert!(matches!(BindEndpoint::parse("127.0.0.1"), Err(EndpointError::MissingPort(_))));
			assert!(matches!(BindEndpoint::parse("127.0.0.1:80/ws"), Err(EndpointError::Path(_))));
		}

		#[test]
		fn hostname_strips_port() {
			assert_eq!(hostname_of("Dispatch.Local:8080"), "dispatch.local");
			assert_eq!(hostname_of("[::1]:8080"), "::1");
			assert_eq!(hostname_of("localhost"), "localhost");
		}
	}
}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in whole seconds.
	#[inline]
	pub fn unix_now_secs() -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_secs()
	}
}

pub mod env {
	/// Trimmed value, `None` when blank.
	pub fn non_empty(v: Option<String>) -> Option<String> {
		v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
	}

	pub fn parse_env_bool(v: &str) -> Option<bool> {
		match v.trim().to_ascii_lowercase().as_str() {
			"1" | "true" | "yes" | "on" => Some(true),
			"0" | "false" | "no" | "off" => Some(false),
			_ => None,
		}
	}

	/// Split a comma-separated list, dropping blanks.
	pub fn split_csv(v: &str) -> Vec<String> {
		v.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect()
	}

	/// Process environment as a lookup function.
	pub fn process_env(key: &str) -> Option<String> {
		std::env::var(key).ok()
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn bools_and_lists() {
			assert_eq!(parse_env_bool(" Yes "), Some(true));
			assert_eq!(parse_env_bool("off"), Some(false));
			assert_eq!(parse_env_bool("maybe"), None);
			assert_eq!(split_csv("a, b,,c "), vec!["a", "b", "c"]);
			assert_eq!(non_empty(Some("  ".into())), None);
		}
	}
}

#[cfg(feature = "telemetry")]
pub mod telemetry {
	use tracing::{info, warn};
	use tracing_subscriber::layer::SubscriberExt;
	use tracing_subscriber::util::SubscriberInitExt;

	/// Install the global subscriber: `RUST_LOG` filter (or `default_filter`), fmt layer,
	/// and an OTLP span exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
	pub fn init_tracing(service: &'static str, default_filter: &str) {
		let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

		let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
			.ok()
			.map(|v| v.trim().to_string())
			.filter(|v| !v.is_empty());
		let base = tracing_subscriber::registry()
			.with(tracing_subscriber::EnvFilter::new(filter))
			.with(tracing_subscriber::fmt::layer().with_target(false));

		let Some(endpoint) = otlp_endpoint else {
			base.init();
			return;
		};

		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer(service);
				global::set_tracer_provider(tracer_provider);

				base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
				info!(%endpoint, service, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	}

	/// Start the Prometheus exporter if a bind address is configured.
	pub fn init_metrics(bind: Option<&str>) {
		let Some(bind) = bind else {
			return;
		};

		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
					.with_http_listener(addr)
					.install()
				{
					warn!(error = %e, "failed to start metrics exporter");
				} else {
					info!(%addr, "metrics exporter listening");
				}
			}
			Err(e) => {
				warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
			}
		}
	}
}
