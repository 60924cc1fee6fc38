//! Cache program wire protocol
//!
//! The build tool starts the daemon as a child process and exchanges
//! newline-delimited JSON over its stdin/stdout. Binary ids travel as
//! base64 strings; a `put` with a non-zero `BodySize` is followed by one
//! extra JSON string holding the base64 body.

pub mod server;

pub use server::{Handler, Server};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Commands advertised in the initial handshake
pub const KNOWN_COMMANDS: [&str; 3] = ["get", "put", "close"];

/// A request from the build tool
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    #[serde(rename = "ID")]
    pub id: i64,

    pub command: String,

    #[serde(rename = "ActionID", default, with = "base64_bytes")]
    pub action_id: Vec<u8>,

    #[serde(rename = "OutputID", default, with = "base64_bytes")]
    pub output_id: Vec<u8>,

    /// Older spelling of `OutputID`
    #[serde(rename = "ObjectID", default, with = "base64_bytes")]
    pub object_id: Vec<u8>,

    #[serde(default)]
    pub body_size: i64,
}

impl Request {
    /// Output id for a put, accepting the legacy field
    pub fn output_id(&self) -> &[u8] {
        if self.output_id.is_empty() {
            &self.object_id
        } else {
            &self.output_id
        }
    }
}

/// A response to one request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    #[serde(rename = "ID")]
    pub id: i64,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub err: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub known_commands: Vec<&'static str>,

    #[serde(skip_serializing_if = "is_false")]
    pub miss: bool,

    #[serde(
        rename = "OutputID",
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "base64_bytes::serialize"
    )]
    pub output_id: Vec<u8>,

    #[serde(skip_serializing_if = "is_zero")]
    pub size: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub disk_path: String,
}

impl Response {
    /// Handshake sent before any request is read
    pub fn hello() -> Self {
        Self {
            known_commands: KNOWN_COMMANDS.to_vec(),
            ..Self::default()
        }
    }

    pub fn ok(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn miss(id: i64) -> Self {
        Self {
            id,
            miss: true,
            ..Self::default()
        }
    }

    pub fn error(id: i64, err: impl std::fmt::Display) -> Self {
        Self {
            id,
            err: err.to_string(),
            ..Self::default()
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// `Vec<u8>` as a standard base64 string; `null` and absent read as empty
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(s.as_bytes())
    }
}
