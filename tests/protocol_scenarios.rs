//! End-to-end reconciliation-loop scenarios (spec.md §8) driven against
//! `ns-test-utils::MockNetReceiver` instead of a real NetReceiver. Each
//! test starts the engine in a background task, lets it run a handful
//! of fast cycles (monitor period pinned to zero), then inspects the
//! mock server's observed state — a black-box perspective matching how
//! `services/forwarder`'s own e2e suite drives a real process against a
//! mock WebSocket server rather than reaching into its internals.

use std::future::Future;
use std::path::Path;
use std::pin::Pin as StdPin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ns_core::{ControlHooks, Engine, EngineConfig, NoopHooks};
use ns_pins::{HandlerError, Pin, PinHandlers, PinWriter};
use ns_protocol::{request_code, Identity};
use ns_test_utils::{MockNetReceiver, MockNetReceiverHandle};
use tokio::sync::watch;

fn identity(host: String) -> Identity {
    Identity {
        mac: "00:00:00:00:00:01".to_owned(),
        device_key: None,
        client_type: "netsender".to_owned(),
        wifi: None,
        host: Some(host),
    }
}

fn write_configured_file(path: &Path, extra: &[(&str, &str)]) {
    let mut body = String::from("ma 00:00:00:00:00:01\ndk 10000001\nct netsender\nmp 0\n");
    for (k, v) in extra {
        body.push_str(k);
        body.push(' ');
        body.push_str(v);
        body.push('\n');
    }
    std::fs::write(path, body).unwrap();
}

/// S1-adjacent: a locally set mode/error is visible on the server only
/// after the VarSum drift invariant pushes it via Act (§4.4).
#[tokio::test]
async fn mode_and_error_reach_the_server_via_pending_push() {
    let server = MockNetReceiver::start().await.unwrap();
    server.set_monitor_period(0);

    let dir = tempfile::tempdir().unwrap();
    let cfg = EngineConfig {
        config_path: dir.path().join("netsender.conf"),
        default_identity: identity(server.base_url()),
        default_monitor_period: Duration::from_millis(5),
        handlers: PinHandlers::new(),
        hooks: Arc::new(NoopHooks),
        log_return: None,
        http_timeout: Duration::from_secs(2),
    };
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (mut engine, handle) = Engine::new(cfg, cancel_rx).unwrap();

    let task = tokio::spawn(async move { engine.run().await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    handle.set_mode("Paused");
    handle.set_error("TestError");

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel_tx.send(true).unwrap();
    let _ = task.await;

    assert_eq!(server.mode(), "Paused");
    assert_eq!(server.error(), "TestError");
}

/// S3/invariant-3: a VarSum mismatch on a poll reply triggers a vars
/// fetch, converging the client's stored VarSum on the server's.
#[tokio::test]
async fn var_sum_drift_triggers_vars_fetch() {
    let server = MockNetReceiver::start().await.unwrap();
    server.set_monitor_period(0);

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("netsender.conf");
    write_configured_file(&config_path, &[]);

    let cfg = EngineConfig {
        config_path,
        default_identity: identity(server.base_url()),
        default_monitor_period: Duration::from_millis(5),
        handlers: PinHandlers::new(),
        hooks: Arc::new(NoopHooks),
        log_return: None,
        http_timeout: Duration::from_secs(2),
    };
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (mut engine, _handle) = Engine::new(cfg, cancel_rx).unwrap();

    let task = tokio::spawn(async move { engine.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.set_vars([("greeting".to_owned(), "hello".to_owned())]);

    tokio::time::sleep(Duration::from_millis(80)).await;
    cancel_tx.send(true).unwrap();
    let _ = task.await;

    let fetched_vars = server
        .requests()
        .into_iter()
        .any(|r| r.path == "/vars" && !r.query.contains_key("md") && !r.query.contains_key("er"));
    assert!(fetched_vars, "expected at least one plain /vars fetch after a VarSum bump");
}

/// S5: an `rc=4` poll reply drives the upgrade hook, then pushes
/// `md=Completed` before the next poll.
#[tokio::test]
async fn upgrade_request_code_pushes_completed_mode() {
    let server = MockNetReceiver::start().await.unwrap();
    server.set_monitor_period(0);

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("netsender.conf");
    write_configured_file(&config_path, &[]);

    let cfg = EngineConfig {
        config_path,
        default_identity: identity(server.base_url()),
        default_monitor_period: Duration::from_millis(5),
        handlers: PinHandlers::new(),
        hooks: Arc::new(NoopHooks),
        log_return: None,
        http_timeout: Duration::from_secs(2),
    };
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (mut engine, _handle) = Engine::new(cfg, cancel_rx).unwrap();

    let task = tokio::spawn(async move { engine.run().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    server.set_next_rc(request_code::UPGRADE);

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel_tx.send(true).unwrap();
    let _ = task.await;

    assert_eq!(server.mode(), "Completed");
}

/// A `ControlHooks` standing in for `src/hooks.rs::UpdaterHooks`'s
/// stage-now/apply-later split: `upgrade()` only records that it ran,
/// `finalize_upgrade()` records the server's mode *at the moment it is
/// called*. If the engine ever called `finalize_upgrade` before the
/// `md=Completed` Act push landed, the recorded mode would not be
/// "Completed" (S5 / §4.4 step 7).
struct TwoPhaseUpgradeHooks {
    server: MockNetReceiverHandle,
    upgrade_called: Arc<Mutex<bool>>,
    mode_seen_at_finalize: Arc<Mutex<Option<String>>>,
}

impl ControlHooks for TwoPhaseUpgradeHooks {
    fn reboot(&self) {}

    fn upgrade<'a>(&'a self) -> StdPin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            *self.upgrade_called.lock().unwrap() = true;
            Ok(())
        })
    }

    fn finalize_upgrade(&self) {
        *self.mode_seen_at_finalize.lock().unwrap() = Some(self.server.mode());
    }
}

/// S5 (two-phase ordering): the engine only calls `finalize_upgrade`
/// after the server has already acknowledged `md=Completed`, matching
/// `src/hooks.rs::UpdaterHooks` staging an update in `upgrade()` and
/// applying/exiting only from `finalize_upgrade()`.
#[tokio::test]
async fn finalize_upgrade_runs_only_after_completed_mode_is_acknowledged() {
    let server = MockNetReceiver::start().await.unwrap();
    server.set_monitor_period(0);

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("netsender.conf");
    write_configured_file(&config_path, &[]);

    let upgrade_called = Arc::new(Mutex::new(false));
    let mode_seen_at_finalize = Arc::new(Mutex::new(None));
    let hooks = Arc::new(TwoPhaseUpgradeHooks {
        server: server.handle(),
        upgrade_called: Arc::clone(&upgrade_called),
        mode_seen_at_finalize: Arc::clone(&mode_seen_at_finalize),
    });

    let cfg = EngineConfig {
        config_path,
        default_identity: identity(server.base_url()),
        default_monitor_period: Duration::from_millis(5),
        handlers: PinHandlers::new(),
        hooks,
        log_return: None,
        http_timeout: Duration::from_secs(2),
    };
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (mut engine, _handle) = Engine::new(cfg, cancel_rx).unwrap();

    let task = tokio::spawn(async move { engine.run().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    server.set_next_rc(request_code::UPGRADE);

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel_tx.send(true).unwrap();
    let _ = task.await;

    assert!(*upgrade_called.lock().unwrap());
    assert_eq!(mode_seen_at_finalize.lock().unwrap().as_deref(), Some("Completed"));
}

/// S6: an output pin named in the poll reply is dispatched to the write
/// handler registered for its kind; pins with no handler are ignored.
#[tokio::test]
async fn output_pin_in_reply_dispatches_write_handler() {
    let server = MockNetReceiver::start().await.unwrap();
    server.set_monitor_period(0);
    server.set_output_pin("D5", serde_json::json!(1));
    server.set_output_pin("X20", serde_json::json!(37));

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("netsender.conf");
    write_configured_file(&config_path, &[("op", "D5")]);

    let written = Arc::new(Mutex::new(Vec::<Pin>::new()));
    struct RecordingWriter(Arc<Mutex<Vec<Pin>>>);
    impl PinWriter for RecordingWriter {
        fn write(&self, pin: &Pin) -> Result<(), HandlerError> {
            self.0.lock().unwrap().push(pin.clone());
            Ok(())
        }
    }
    let handlers = PinHandlers::new().with_writer('D', Arc::new(RecordingWriter(Arc::clone(&written))));

    let cfg = EngineConfig {
        config_path,
        default_identity: identity(server.base_url()),
        default_monitor_period: Duration::from_millis(5),
        handlers,
        hooks: Arc::new(NoopHooks),
        log_return: None,
        http_timeout: Duration::from_secs(2),
    };
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (mut engine, _handle) = Engine::new(cfg, cancel_rx).unwrap();

    let task = tokio::spawn(async move { engine.run().await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    cancel_tx.send(true).unwrap();
    let _ = task.await;

    let seen = written.lock().unwrap();
    assert!(seen.iter().any(|p| p.name == "D5" && p.value == 1));
    // X20 has no 'X' writer registered above -- never reaches RecordingWriter.
    assert!(!seen.iter().any(|p| p.name == "X20"));
}

/// `er` in a poll reply aborts pin-value processing: mode is set to
/// Paused and no write handler fires for that cycle (open question (a)).
#[tokio::test]
async fn server_error_on_poll_sets_paused_and_skips_pin_values() {
    let server = MockNetReceiver::start().await.unwrap();
    server.set_monitor_period(0);
    server.set_output_pin("D5", serde_json::json!(1));
    server.set_poll_error("overload");

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("netsender.conf");
    write_configured_file(&config_path, &[("op", "D5")]);

    let written = Arc::new(Mutex::new(Vec::<Pin>::new()));
    struct RecordingWriter(Arc<Mutex<Vec<Pin>>>);
    impl PinWriter for RecordingWriter {
        fn write(&self, pin: &Pin) -> Result<(), HandlerError> {
            self.0.lock().unwrap().push(pin.clone());
            Ok(())
        }
    }
    let handlers = PinHandlers::new().with_writer('D', Arc::new(RecordingWriter(Arc::clone(&written))));

    let cfg = EngineConfig {
        config_path,
        default_identity: identity(server.base_url()),
        default_monitor_period: Duration::from_millis(5),
        handlers,
        hooks: Arc::new(NoopHooks),
        log_return: None,
        http_timeout: Duration::from_secs(2),
    };
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (mut engine, _handle) = Engine::new(cfg, cancel_rx).unwrap();

    let task = tokio::spawn(async move { engine.run().await });
    tokio::time::sleep(Duration::from_millis(40)).await;
    cancel_tx.send(true).unwrap();
    let _ = task.await;

    assert_eq!(server.error(), "");
    assert!(written.lock().unwrap().is_empty());
}
