// ns-protocol: wire types for the NetSender client/NetReceiver protocol.
//
// All four request kinds (Config, Poll, Vars, Act) return the same JSON
// response shape: a handful of fixed fields (`rc`, `vs`, `er`) plus a
// dynamic set of pin/var keys whose presence depends on what was asked
// for. That shape is modeled as `ResponseEnvelope` with the dynamic part
// flattened into a map, and accessed through typed getters rather than a
// rigid struct per request kind.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Request codes
// ---------------------------------------------------------------------------

/// The server's out-of-band control channel, carried as `rc` on every reply.
pub mod request_code {
    pub const NOOP: i32 = 0;
    pub const RECONFIGURE: i32 = 1;
    pub const REBOOT: i32 = 2;
    pub const DEBUG: i32 = 3;
    pub const UPGRADE: i32 = 4;
}

/// Reserved pin names with fixed meaning across all device variants.
pub mod reserved_pins {
    pub const LOG_UPLOAD: &str = "T0";
    pub const BINARY_READER_OUTPUT: &str = "B0";
    pub const CPU_TEMP: &str = "X20";
    pub const CPU_USAGE: &str = "X21";
    pub const VIRTUAL_MEM: &str = "X22";
    pub const WIND_SPEED: &str = "X30";
    pub const WIND_GUST: &str = "X31";
    pub const WIND_DIRECTION: &str = "X32";
    pub const RAINFALL: &str = "X33";
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Device identity as persisted by the config store and exchanged with the
/// `/config` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// 12-hex MAC-style identifier.
    pub mac: String,
    /// Assigned by the server on first successful configure.
    pub device_key: Option<u32>,
    pub client_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi: Option<WifiCredentials>,
    /// Overrides the well-known production host when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

pub const DEFAULT_SERVICE_HOST: &str = "data.ausocean.org";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// The shared JSON response shape for all four request kinds.
///
/// `rc`, `vs` and `er` are always present with fixed meaning; everything
/// else (assigned `ma`/`dk`/`mp`, output pin values, variable values) is
/// carried in `fields` and read through [`ResponseEnvelope::int`] /
/// [`ResponseEnvelope::string`].
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub rc: i32,
    pub vs: u16,
    #[serde(default)]
    pub er: Option<String>,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

impl ResponseEnvelope {
    /// Fetch `key` as an integer. Fails if the key is absent or the value
    /// is not a JSON number (a quoted `"123"` does not coerce).
    pub fn int(&self, key: &str) -> Result<i64, DecodeError> {
        let value = self
            .fields
            .get(key)
            .ok_or_else(|| DecodeError::MissingKey(key.to_owned()))?;
        value.as_i64().ok_or_else(|| DecodeError::WrongType {
            key: key.to_owned(),
            expected: "integer",
        })
    }

    /// Fetch `key` as a string. Fails if the key is absent or the value is
    /// not a JSON string.
    pub fn string(&self, key: &str) -> Result<String, DecodeError> {
        let value = self
            .fields
            .get(key)
            .ok_or_else(|| DecodeError::MissingKey(key.to_owned()))?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| DecodeError::WrongType {
                key: key.to_owned(),
                expected: "string",
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    MissingKey(String),
    WrongType { key: String, expected: &'static str },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MissingKey(k) => write!(f, "missing key '{k}'"),
            DecodeError::WrongType { key, expected } => {
                write!(f, "key '{key}' is not a {expected}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}
