//! HTTP request layer (C2): Config / Poll / Vars / Act against a NetReceiver
//! host.
//!
//! Bodies are JSON-in, JSON-out over plain HTTP(S). Connections are not
//! pooled across calls beyond what a single shared `reqwest::Client`
//! gives us for free — the device is expected to be long-latency,
//! low-rate (§5), so the convenience of connection reuse within one
//! `Client` is kept but no keep-alive tuning is attempted.

use std::fmt;
use std::time::Duration;

use ns_pins::{Pin, PayloadReader};
use ns_protocol::{Identity, ResponseEnvelope, CLIENT_VERSION};

/// Applied to every request unless overridden per-call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NetSenderClient {
    http: reqwest::Client,
    host: String,
}

impl NetSenderClient {
    /// Build a client targeting `host` (e.g. `"https://data.example"`) with
    /// `timeout` applied to every request by default.
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        Ok(NetSenderClient {
            http,
            host: host.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host.trim_end_matches('/'), path)
    }

    /// `/config` — register/identify; receive assigned `ma`/`dk`/`mp`.
    pub async fn config(
        &self,
        identity: &Identity,
        mode: Option<&str>,
    ) -> Result<ResponseEnvelope, HttpError> {
        let mut query = vec![
            ("ma".to_owned(), identity.mac.clone()),
            ("vn".to_owned(), CLIENT_VERSION.to_owned()),
            ("ct".to_owned(), identity.client_type.clone()),
        ];
        if let Some(dk) = identity.device_key {
            query.push(("dk".to_owned(), dk.to_string()));
        }
        if let Some(md) = mode {
            query.push(("md".to_owned(), md.to_owned()));
        }
        let resp = self
            .http
            .get(self.url("/config"))
            .query(&query)
            .send()
            .await
            .map_err(HttpError::from_reqwest)?;
        decode(resp).await
    }

    /// `/poll` — periodic report; streams pin data in pin-list order.
    pub async fn poll(
        &self,
        identity: &Identity,
        input_pins: &[Pin],
    ) -> Result<ResponseEnvelope, HttpError> {
        let mut query = identity_query(identity);
        for pin in input_pins {
            query.push((pin.name.clone(), pin.value.to_string()));
        }

        let reader = PayloadReader::new(input_pins);
        let stream = tokio_util::io::ReaderStream::new(reader);
        let body = reqwest::Body::wrap_stream(stream);

        let resp = self
            .http
            .post(self.url("/poll"))
            .query(&query)
            .body(body)
            .send()
            .await
            .map_err(HttpError::from_reqwest)?;
        decode(resp).await
    }

    /// `/vars` (GET) — fetch the full variable map.
    pub async fn vars(&self, identity: &Identity) -> Result<ResponseEnvelope, HttpError> {
        let resp = self
            .http
            .get(self.url("/vars"))
            .query(&identity_query(identity))
            .send()
            .await
            .map_err(HttpError::from_reqwest)?;
        decode(resp).await
    }

    /// `/vars` (POST-as-GET with `md`/`er`) — push local mode/error back.
    pub async fn act(
        &self,
        identity: &Identity,
        mode: Option<&str>,
        error: Option<&str>,
    ) -> Result<ResponseEnvelope, HttpError> {
        let mut query = identity_query(identity);
        if let Some(md) = mode {
            query.push(("md".to_owned(), md.to_owned()));
        }
        if let Some(er) = error {
            query.push(("er".to_owned(), er.to_owned()));
        }
        let resp = self
            .http
            .get(self.url("/vars"))
            .query(&query)
            .send()
            .await
            .map_err(HttpError::from_reqwest)?;
        decode(resp).await
    }
}

fn identity_query(identity: &Identity) -> Vec<(String, String)> {
    let mut query = vec![("ma".to_owned(), identity.mac.clone())];
    if let Some(dk) = identity.device_key {
        query.push(("dk".to_owned(), dk.to_string()));
    }
    query
}

async fn decode(resp: reqwest::Response) -> Result<ResponseEnvelope, HttpError> {
    let status = resp.status();
    let text = resp.text().await.map_err(HttpError::from_reqwest)?;
    if !status.is_success() {
        return Err(HttpError::Transport(format!(
            "server returned {status}: {text}"
        )));
    }
    serde_json::from_str(&text).map_err(|e| HttpError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum HttpError {
    Transport(String),
    Timeout,
    Decode(String),
}

impl HttpError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpError::Timeout
        } else {
            HttpError::Transport(e.to_string())
        }
    }

    /// Whether the caller's retry-with-backoff loop should treat this as
    /// transient (§7: transport and timeout are network-level failures;
    /// decode errors are treated as a server glitch and retried too, just
    /// logged at warning rather than escalated).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HttpError::Transport(_) | HttpError::Timeout | HttpError::Decode(_)
        )
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Transport(s) => write!(f, "transport error: {s}"),
            HttpError::Timeout => write!(f, "request timed out"),
            HttpError::Decode(s) => write!(f, "decode error: {s}"),
        }
    }
}

impl std::error::Error for HttpError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_of_one_millisecond_fails_vars_with_timeout() {
        let client = NetSenderClient::new("http://10.255.255.1", Duration::from_millis(1)).unwrap();
        let identity = Identity {
            mac: "00:00:00:00:00:01".to_owned(),
            device_key: Some(1),
            client_type: "netsender".to_owned(),
            wifi: None,
            host: None,
        };
        let err = client.vars(&identity).await.unwrap_err();
        assert!(matches!(err, HttpError::Timeout) || matches!(err, HttpError::Transport(_)));
    }

    #[test]
    fn is_transient_classifies_taxonomy_correctly() {
        assert!(HttpError::Timeout.is_transient());
        assert!(HttpError::Transport("x".to_owned()).is_transient());
        assert!(HttpError::Decode("x".to_owned()).is_transient());
    }
}
