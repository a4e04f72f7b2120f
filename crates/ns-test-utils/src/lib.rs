//! Mock NetReceiver ("spoofer") HTTP server for exercising `ns-core`'s
//! reconciliation loop end-to-end without a real cloud service.
//!
//! Grounded on the mock-server-with-scriptable-responses shape of
//! `rt_test_utils::MockWsServer` (bind to a random port, hand back the
//! bound address, run the accept loop in a background task) adapted from
//! a WebSocket handshake protocol to the plain HTTP request/response
//! shape this spec describes. `services/emulator`'s standalone
//! harness-binary pattern is what `services/spoofer` (in the workspace
//! root) is grounded on in turn.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use ns_protocol::request_code;
use serde_json::{json, Map, Value};

/// One recorded request, kept for assertions in tests (query params and
/// raw body so a test can verify the payload-reader encoding reached the
/// wire the way `ns-pins::PayloadReader` produced it).
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    device_key: u32,
    monitor_period: u64,
    var_sum: u16,
    vars: HashMap<String, String>,
    mode: String,
    error: String,
    next_rc: i32,
    /// Server-side-injected `er`, carried on every `/poll` response
    /// until explicitly cleared (open question (a): `er` together with
    /// pin values on a poll).
    poll_error: Option<String>,
    output_pins: HashMap<String, Value>,
    requests: Vec<RecordedRequest>,
}

/// A scripted mock of the four NetReceiver endpoints (`/config`, `/poll`,
/// `/vars` fetch, `/vars` act). Every call is recorded; behavior is
/// steered by the `set_*`/`queue_*` methods before the client under test
/// issues its next request.
pub struct MockNetReceiver {
    addr: SocketAddr,
    state: Arc<Mutex<Inner>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockNetReceiver {
    /// Start the mock server on a random local port with default state
    /// (`device_key=10_000_001`, `monitor_period=30`, `mode="Normal"`,
    /// `var_sum=0`).
    pub async fn start() -> std::io::Result<Self> {
        Self::with_device_key(10_000_001).await
    }

    pub async fn with_device_key(device_key: u32) -> std::io::Result<Self> {
        Self::bind("127.0.0.1:0", device_key).await
    }

    /// Override the monitor period the `/config` response hands back.
    /// Tests use a short period so a reconciliation loop reaches Run
    /// and completes several cycles without a slow real-time sleep.
    pub fn set_monitor_period(&self, secs: u64) {
        self.state.lock().unwrap().monitor_period = secs;
    }

    /// Bind to a specific address instead of a random port — used by the
    /// `spoofer` binary, where an operator wants a stable, predictable URL.
    pub async fn bind(addr: &str, device_key: u32) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(Mutex::new(Inner {
            device_key,
            monitor_period: 30,
            mode: "Normal".to_owned(),
            ..Inner::default()
        }));

        let router = Router::new()
            .route("/config", get(config_handler))
            .route("/poll", post(poll_handler))
            .route("/vars", get(vars_handler))
            .with_state(Arc::clone(&state));

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router.into_make_service()).await;
        });

        Ok(MockNetReceiver {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Set the `rc` value the *next* poll response carries. Auto-resets
    /// to `NOOP` once consumed, so a test does not need to clean up
    /// after itself.
    pub fn set_next_rc(&self, rc: i32) {
        self.state.lock().unwrap().next_rc = rc;
    }

    /// Inject a server error: carried on every poll response until
    /// [`MockNetReceiver::clear_poll_error`] is called (§4.2: `er` aborts
    /// further local processing of that response).
    pub fn set_poll_error(&self, er: impl Into<String>) {
        self.state.lock().unwrap().poll_error = Some(er.into());
    }

    pub fn clear_poll_error(&self) {
        self.state.lock().unwrap().poll_error = None;
    }

    /// Replace the server-side variable map, bumping `var_sum` so the
    /// next poll's drift check observes a change (§8 property 3).
    pub fn set_vars(&self, vars: impl IntoIterator<Item = (String, String)>) {
        let mut inner = self.state.lock().unwrap();
        inner.vars = vars.into_iter().collect();
        inner.var_sum = inner.var_sum.wrapping_add(1);
    }

    pub fn var_sum(&self) -> u16 {
        self.state.lock().unwrap().var_sum
    }

    pub fn mode(&self) -> String {
        self.state.lock().unwrap().mode.clone()
    }

    pub fn error(&self) -> String {
        self.state.lock().unwrap().error.clone()
    }

    /// A cheap, `Clone` handle onto the same shared state, for a test
    /// hook that needs to observe server state from inside a
    /// `ControlHooks` callback rather than through `&MockNetReceiver`
    /// itself (which the engine under test has already taken ownership
    /// of its handlers, not the mock server).
    pub fn handle(&self) -> MockNetReceiverHandle {
        MockNetReceiverHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Queue a value the next poll response will carry under `pin_name`
    /// (an integer output-pin value, or a string for a text pin).
    pub fn set_output_pin(&self, pin_name: impl Into<String>, value: Value) {
        self.state
            .lock()
            .unwrap()
            .output_pins
            .insert(pin_name.into(), value);
    }
}

/// See [`MockNetReceiver::handle`].
#[derive(Clone)]
pub struct MockNetReceiverHandle {
    state: Arc<Mutex<Inner>>,
}

impl MockNetReceiverHandle {
    pub fn mode(&self) -> String {
        self.state.lock().unwrap().mode.clone()
    }
}

async fn config_handler(
    State(state): State<Arc<Mutex<Inner>>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mut inner = state.lock().unwrap();
    inner.requests.push(RecordedRequest {
        path: "/config".to_owned(),
        query: query.clone(),
        body: Vec::new(),
    });
    let ma = query.get("ma").cloned().unwrap_or_default();
    Json(json!({
        "rc": request_code::NOOP,
        "vs": inner.var_sum,
        "ma": ma,
        "dk": inner.device_key,
        "mp": inner.monitor_period,
    }))
}

async fn poll_handler(
    State(state): State<Arc<Mutex<Inner>>>,
    Query(query): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Json<Value> {
    let mut inner = state.lock().unwrap();
    inner.requests.push(RecordedRequest {
        path: "/poll".to_owned(),
        query: query.clone(),
        body: body.to_vec(),
    });

    let rc = inner.next_rc;
    inner.next_rc = request_code::NOOP;

    let mut fields = Map::new();
    fields.insert("rc".to_owned(), json!(rc));
    fields.insert("vs".to_owned(), json!(inner.var_sum));

    if let Some(er) = inner.poll_error.clone() {
        // Open question (a): the spec's chosen behavior is that the
        // client ignores pin values when `er` is present, so the mock
        // sends both — it is the client's job to discard the pins.
        fields.insert("er".to_owned(), json!(er));
    }
    for (name, value) in &inner.output_pins {
        fields.insert(name.clone(), value.clone());
    }

    Json(Value::Object(fields))
}

async fn vars_handler(
    State(state): State<Arc<Mutex<Inner>>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mut inner = state.lock().unwrap();
    inner.requests.push(RecordedRequest {
        path: "/vars".to_owned(),
        query: query.clone(),
        body: Vec::new(),
    });

    let is_act = query.contains_key("md") || query.contains_key("er");
    if is_act {
        if let Some(md) = query.get("md") {
            inner.mode = md.clone();
        }
        if let Some(er) = query.get("er") {
            inner.error = er.clone();
        }
        inner.var_sum = inner.var_sum.wrapping_add(1);
        return Json(json!({"rc": request_code::NOOP, "vs": inner.var_sum}));
    }

    let mut fields = Map::new();
    fields.insert("rc".to_owned(), json!(request_code::NOOP));
    fields.insert("vs".to_owned(), json!(inner.var_sum));
    fields.insert("mode".to_owned(), json!(inner.mode));
    fields.insert("error".to_owned(), json!(inner.error));
    for (k, v) in &inner.vars {
        fields.insert(k.clone(), json!(v));
    }
    Json(Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn config_assigns_device_key_and_monitor_period() {
        let server = MockNetReceiver::start().await.unwrap();
        let resp: Value = reqwest::get(format!("{}/config?ma=00:00:00:00:00:01&ct=netsender&vn=1", server.base_url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["dk"], 10_000_001);
        assert_eq!(resp["mp"], 30);
    }

    #[tokio::test]
    async fn set_vars_bumps_var_sum() {
        let server = MockNetReceiver::start().await.unwrap();
        let before = server.var_sum();
        server.set_vars([("mode".to_owned(), "Normal".to_owned())]);
        assert_ne!(server.var_sum(), before);
    }

    #[tokio::test]
    async fn act_updates_mode_and_error_and_is_recorded() {
        let server = MockNetReceiver::start().await.unwrap();
        let client = reqwest::Client::new();
        let _: Value = client
            .get(format!(
                "{}/vars?ma=00:00:00:00:00:01&dk=1&md=Paused&er=TestError",
                server.base_url()
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(server.mode(), "Paused");
        assert_eq!(server.error(), "TestError");
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn poll_records_body_bytes() {
        let server = MockNetReceiver::start().await.unwrap();
        let client = reqwest::Client::new();
        client
            .post(format!("{}/poll?ma=x&dk=1&X1=3", server.base_url()))
            .body(vec![1u8, 2, 3])
            .send()
            .await
            .unwrap();
        let reqs = server.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].body, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn rc_resets_to_noop_after_one_poll() {
        let server = MockNetReceiver::start().await.unwrap();
        server.set_next_rc(request_code::REBOOT);
        let client = reqwest::Client::new();
        let first: Value = client
            .post(format!("{}/poll?ma=x&dk=1", server.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first["rc"], request_code::REBOOT);

        let second: Value = client
            .post(format!("{}/poll?ma=x&dk=1", server.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(second["rc"], request_code::NOOP);
    }
}
