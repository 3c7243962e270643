#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Realtime message unit: `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	pub event: String,
	pub data: Map<String, Value>,
}

/// Errors for envelopes that don't match the wire shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
	#[error("invalid json: {0}")]
	Json(String),
	#[error("envelope must be a json object")]
	NotAnObject,
	#[error("missing or non-string \"event\"")]
	MissingEvent,
	#[error("empty event name")]
	EmptyEvent,
	#[error("\"data\" must be a json object")]
	DataNotAnObject,
}

impl Envelope {
	pub fn new(event: impl Into<String>, data: Map<String, Value>) -> Self {
		Self {
			event: event.into(),
			data,
		}
	}

	/// Build from a `serde_json::Value` that is expected to be an object; anything else
	/// becomes an empty `data` map.
	pub fn with_value(event: impl Into<String>, data: Value) -> Self {
		let data = match data {
			Value::Object(map) => map,
			_ => Map::new(),
		};
		Self::new(event, data)
	}

	/// Parse a wire payload, rejecting anything that isn't exactly the envelope shape.
	pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
		let value: Value = serde_json::from_str(raw).map_err(|e| EnvelopeError::Json(e.to_string()))?;
		Self::from_value(value)
	}

	pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
		let Value::Object(mut obj) = value else {
			return Err(EnvelopeError::NotAnObject);
		};

		let event = match obj.remove("event") {
			Some(Value::String(s)) => s,
			_ => return Err(EnvelopeError::MissingEvent),
		};
		if event.trim().is_empty() {
			return Err(EnvelopeError::EmptyEvent);
		}

		let data = match obj.remove("data") {
			Some(Value::Object(map)) => map,
			_ => return Err(EnvelopeError::DataNotAnObject),
		};

		Ok(Self { event, data })
	}

	/// Serialize to the wire format.
	pub fn to_json(&self) -> String {
		self.to_string()
	}
}

impl fmt::Display for Envelope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = serde_json::to_string(self).map_err(|_| fmt::Error)?;
		f.write_str(&s)
	}
}

/// Administrative role carried in realtime tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Viewer,
	Editor,
	Admin,
	Superadmin,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Viewer => "viewer",
			Role::Editor => "editor",
			Role::Admin => "admin",
			Role::Superadmin => "superadmin",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseRoleError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	Unknown(String),
}

impl FromStr for Role {
	type Err = ParseRoleError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseRoleError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"viewer" => Ok(Role::Viewer),
			"editor" => Ok(Role::Editor),
			"admin" => Ok(Role::Admin),
			"superadmin" | "super_admin" => Ok(Role::Superadmin),
			other => Err(ParseRoleError::Unknown(other.to_string())),
		}
	}
}

/// Current token claims format version.
pub const TOKEN_CLAIMS_VERSION: u32 = 1;

/// Signed payload of a realtime token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
	pub sub: String,
	pub role: Role,
	pub v: u32,
	/// Unix seconds at issuance.
	pub iat: u64,
}

/// Verified identity attached to an admitted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
	pub subject: String,
	pub role: Role,
}

impl From<TokenClaims> for Identity {
	fn from(claims: TokenClaims) -> Self {
		Self {
			subject: claims.sub,
			role: claims.role,
		}
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}({})", self.subject, self.role)
	}
}

/// Per-connection unique session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SessionId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		uuid::Uuid::parse_str(s.trim()).map(Self)
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn envelope_parse_and_serialize() {
		let env = Envelope::from_json(r#"{"event":"pending_created","data":{"id":777}}"#).unwrap();
		assert_eq!(env.event, "pending_created");
		assert_eq!(env.data.get("id"), Some(&json!(777)));

		let back: Value = serde_json::from_str(&env.to_json()).unwrap();
		assert_eq!(back, json!({"event": "pending_created", "data": {"id": 777}}));
	}

	#[test]
	fn envelope_rejects_wrong_shapes() {
		assert!(matches!(Envelope::from_json("not json"), Err(EnvelopeError::Json(_))));
		assert_eq!(Envelope::from_json("[1,2]"), Err(EnvelopeError::NotAnObject));
		assert_eq!(Envelope::from_json(r#"{"data":{}}"#), Err(EnvelopeError::MissingEvent));
		assert_eq!(
			Envelope::from_json(r#"{"event":7,"data":{}}"#),
			Err(EnvelopeError::MissingEvent)
		);
		assert_eq!(Envelope::from_json(r#"{"event":" ","data":{}}"#), Err(EnvelopeError::EmptyEvent));
		assert_eq!(
			Envelope::from_json(r#"{"event":"x","data":[1]}"#),
			Err(EnvelopeError::DataNotAnObject)
		);
	}

	#[test]
	fn role_parse_and_order() {
		assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
		assert_eq!("super_admin".parse::<Role>().unwrap(), Role::Superadmin);
		assert!("root".parse::<Role>().is_err());
		assert!(Role::Editor > Role::Viewer);
		assert!(Role::Superadmin > Role::Admin);
	}

	#[test]
	fn secret_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert!(!format!("{s:?}").contains("hunter2"));
	}
}
