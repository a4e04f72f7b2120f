//! Reconciliation loop (C4): Init → Configure → Run.
//!
//! The loop is the single owner of `Mode`, `Error`, `VarSum` and the vars
//! map (§9). External callers reach it only through [`EngineHandle`],
//! which enqueues a pending mode/error change that the loop picks up at
//! the top of its next cycle — never a direct mutation of loop-owned
//! state.

mod backoff;
pub mod interrupt;
pub mod remote_log;

pub use backoff::Backoff;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin as StdPin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ns_config::{ConfigError, DeviceConfig};
use ns_http::{HttpError, NetSenderClient};
use ns_logreturn::{LogReturnAdapter, OfferedBackup, LOG_RETURN_PIN_NAME};
use ns_pins::{make_pins, Pin, PinHandlers};
use ns_protocol::{request_code, Identity, ResponseEnvelope};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Control hooks (rc=2 reboot, rc=4 upgrade)
// ---------------------------------------------------------------------------

/// Reboot/upgrade side effects, supplied at construction rather than
/// assigned as mutable globals (§9, "pluggable handlers").
///
/// `upgrade` and `finalize_upgrade` are split in two because §4.4 step 7
/// requires `md=Completed` to reach the server *before* the running
/// binary is replaced/exits: a hook that downloads-and-exits in one call
/// would make the engine's follow-up Act call unreachable. `upgrade`
/// must only stage the update (or no-op); any process-terminating side
/// effect belongs in `finalize_upgrade`, which the engine calls only
/// after the Act push has completed.
pub trait ControlHooks: Send + Sync {
    fn reboot(&self);

    fn upgrade<'a>(&'a self) -> StdPin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

    /// Called once `upgrade`'s staged update has been acknowledged to the
    /// server. Default no-op for hooks with nothing left to apply.
    fn finalize_upgrade(&self) {}
}

/// A `ControlHooks` that logs and does nothing — useful for variants with
/// no reboot/upgrade mechanism, or for tests.
pub struct NoopHooks;

impl ControlHooks for NoopHooks {
    fn reboot(&self) {
        warn!("reboot requested but no reboot hook is configured");
    }

    fn upgrade<'a>(&'a self) -> StdPin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async {
            warn!("upgrade requested but no upgrade hook is configured");
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Shared pending mode/error change
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingChange {
    mode: Option<String>,
    error: Option<String>,
}

/// A handle external tasks use to request a mode/error change. The change
/// is not visible to the server until the next cycle's poll pushes it
/// (the VarSum drift invariant, §4.4).
#[derive(Clone)]
pub struct EngineHandle {
    pending: Arc<Mutex<PendingChange>>,
}

impl EngineHandle {
    pub fn set_mode(&self, mode: impl Into<String>) {
        self.pending.lock().unwrap().mode = Some(mode.into());
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.pending.lock().unwrap().error = Some(error.into());
    }
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

pub struct EngineConfig {
    pub config_path: PathBuf,
    /// Used to seed identity on first run, when the config file is
    /// absent or not yet fully configured.
    pub default_identity: Identity,
    /// Used for Configure-phase backoff before a monitor period has ever
    /// been learned from the server.
    pub default_monitor_period: Duration,
    pub handlers: PinHandlers,
    pub hooks: Arc<dyn ControlHooks>,
    pub log_return: Option<LogReturnAdapter>,
    pub http_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    config_path: PathBuf,
    device_config: DeviceConfig,
    identity: Identity,
    monitor_period: Duration,
    client: NetSenderClient,
    handlers: PinHandlers,
    hooks: Arc<dyn ControlHooks>,
    log_return: Option<LogReturnAdapter>,
    pending: Arc<Mutex<PendingChange>>,
    cancel: watch::Receiver<bool>,

    mode: String,
    error: String,
    var_sum: u16,
    vars: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("fatal config error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to construct HTTP client: {0}")]
    Http(#[from] HttpError),
    #[error("cooperative shutdown")]
    Cancelled,
    #[error("failed to construct control hooks: {0}")]
    Hooks(String),
}

enum LoopState {
    Init,
    Configure,
    Run,
}

impl Engine {
    /// Build a new engine plus the handle external callers use to request
    /// mode/error changes. `cancel` fires `true` on shutdown.
    pub fn new(cfg: EngineConfig, cancel: watch::Receiver<bool>) -> Result<(Self, EngineHandle), HttpError> {
        let client = NetSenderClient::new(
            cfg.default_identity
                .host
                .clone()
                .unwrap_or_else(|| ns_protocol::DEFAULT_SERVICE_HOST.to_owned()),
            cfg.http_timeout,
        )?;
        let pending = Arc::new(Mutex::new(PendingChange::default()));
        let handle = EngineHandle {
            pending: Arc::clone(&pending),
        };
        let engine = Engine {
            config_path: cfg.config_path,
            device_config: DeviceConfig::empty(),
            identity: cfg.default_identity,
            monitor_period: cfg.default_monitor_period,
            client,
            handlers: cfg.handlers,
            hooks: cfg.hooks,
            log_return: cfg.log_return,
            pending,
            cancel,
            mode: "Normal".to_owned(),
            error: String::new(),
            var_sum: 0,
            vars: HashMap::new(),
        };
        Ok((engine, handle))
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn var_sum(&self) -> u16 {
        self.var_sum
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// Run the reconciliation loop until cancelled, or until the server
    /// (or a local caller via [`EngineHandle::set_mode`]) sets mode to
    /// `Stopped` (§6: "Exit codes: 0 normal termination on mode=Stop").
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let mut state = LoopState::Init;
        loop {
            if *self.cancel.borrow() {
                return Err(EngineError::Cancelled);
            }
            if self.mode == "Stopped" {
                info!("mode observed as Stopped; exiting reconciliation loop cleanly");
                return Ok(());
            }
            state = match state {
                LoopState::Init => self.step_init()?,
                LoopState::Configure => self.step_configure().await,
                LoopState::Run => self.step_run().await,
            };
        }
    }

    fn step_init(&mut self) -> Result<LoopState, EngineError> {
        match ns_config::load(&self.config_path) {
            Ok(cfg) if cfg.is_configured() => {
                self.apply_device_config(cfg);
                info!("identity loaded from disk; resuming in Run");
                Ok(LoopState::Run)
            }
            Ok(cfg) => {
                self.device_config = cfg;
                Ok(LoopState::Configure)
            }
            Err(ConfigError::Missing(_)) => Ok(LoopState::Configure),
            Err(e @ ConfigError::Parse(_)) => Err(EngineError::Config(e)),
            Err(ConfigError::Io(msg)) => {
                warn!(error = %msg, "transient IO error reading config, retrying via Configure");
                Ok(LoopState::Configure)
            }
        }
    }

    fn apply_device_config(&mut self, cfg: DeviceConfig) {
        if let Some(mac) = &cfg.mac {
            self.identity.mac = mac.clone();
        }
        self.identity.device_key = cfg.device_key;
        if let Some(ct) = &cfg.client_type {
            self.identity.client_type = ct.clone();
        }
        if let Some(host) = &cfg.service_host {
            self.identity.host = Some(host.clone());
        }
        if let Some(mp) = cfg.monitor_period {
            self.monitor_period = Duration::from_secs(mp);
        }
        self.device_config = cfg;
    }

    async fn step_configure(&mut self) -> LoopState {
        let mut backoff = Backoff::for_monitor_period(self.monitor_period);
        loop {
            if *self.cancel.borrow() {
                return LoopState::Configure;
            }
            match self.client.config(&self.identity, None).await {
                Ok(resp) => {
                    self.apply_configure_response(&resp);
                    if let Err(e) = ns_config::save(&self.config_path, &self.device_config) {
                        warn!(error = %e, "failed to persist configure response");
                    }
                    info!(mp = ?self.monitor_period, "configure succeeded");
                    return LoopState::Run;
                }
                Err(e) => {
                    // Every HttpError variant is transient (§7); a
                    // non-transient failure here would still need to back
                    // off rather than busy-loop, so the level is cosmetic.
                    if e.is_transient() {
                        warn!(error = %e, "configure failed, backing off");
                    } else {
                        error!(error = %e, "configure failed with non-transient error, backing off");
                    }
                    let delay = backoff.next_delay();
                    if self.sleep_or_cancel(delay).await {
                        return LoopState::Configure;
                    }
                }
            }
        }
    }

    fn apply_configure_response(&mut self, resp: &ResponseEnvelope) {
        let mut cfg = self.device_config.clone();
        cfg.mac = Some(self.identity.mac.clone());
        if let Ok(dk) = resp.int("dk") {
            cfg.device_key = Some(dk as u32);
            self.identity.device_key = Some(dk as u32);
        }
        if let Ok(mp) = resp.int("mp") {
            cfg.monitor_period = Some(mp as u64);
            self.monitor_period = Duration::from_secs(mp as u64);
        }
        cfg.client_type = Some(self.identity.client_type.clone());
        self.device_config = cfg;
        self.var_sum = resp.vs;
    }

    async fn step_run(&mut self) -> LoopState {
        // VarSum drift invariant: push any pending local mode/error change
        // before this cycle's poll, not after.
        let pending = {
            let mut guard = self.pending.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        if pending.mode.is_some() || pending.error.is_some() {
            match self
                .client
                .act(&self.identity, pending.mode.as_deref(), pending.error.as_deref())
                .await
            {
                Ok(resp) => {
                    if let Some(m) = pending.mode {
                        self.mode = m;
                    }
                    if let Some(e) = pending.error {
                        self.error = e;
                    }
                    self.var_sum = resp.vs;
                }
                Err(e) => {
                    warn!(error = %e, "failed to push pending mode/error change, will retry next cycle");
                    let mut guard = self.pending.lock().unwrap();
                    guard.mode = pending.mode;
                    guard.error = pending.error;
                }
            }
        }

        let mut input_pins = self.build_input_pins();
        for pin in &mut input_pins {
            if let Err(e) = self.handlers.dispatch_read(pin) {
                warn!(pin = %pin.name, error = %e, "read handler failed");
            }
        }

        let log_return_names: Vec<String> = input_pins.iter().map(|p| p.name.clone()).collect();
        let offered = if LogReturnAdapter::is_enabled(&log_return_names) {
            match &self.log_return {
                Some(adapter) => match adapter.offer() {
                    Ok(offered) => {
                        input_pins = merge_log_return_pins(input_pins, &offered);
                        offered
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to enumerate log-return backups");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let resp = match self.client.poll(&self.identity, &input_pins).await {
            Ok(resp) => resp,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "poll failed, retrying next cycle within Run");
                self.sleep_or_cancel(self.monitor_period).await;
                return LoopState::Run;
            }
            Err(e) => {
                error!(error = %e, "poll failed with non-transient error, retrying next cycle within Run");
                self.sleep_or_cancel(self.monitor_period).await;
                return LoopState::Run;
            }
        };

        if let Some(er) = &resp.er {
            // Open question (a): ignore pin values when `er` is present.
            self.error = er.clone();
            self.mode = "Paused".to_owned();
            self.sleep_or_cancel(self.monitor_period).await;
            return LoopState::Run;
        }

        if resp.vs != self.var_sum {
            match self.client.vars(&self.identity).await {
                Ok(vars_resp) => {
                    self.var_sum = vars_resp.vs;
                    for (k, v) in &vars_resp.fields {
                        if let Some(s) = v.as_str() {
                            self.vars.insert(k.clone(), s.to_owned());
                        }
                    }
                    if let Ok(m) = vars_resp.string("mode") {
                        self.mode = m;
                    }
                    if let Ok(e) = vars_resp.string("error") {
                        self.error = e;
                    }
                }
                Err(e) => warn!(error = %e, "vars fetch failed after VarSum drift"),
            }
        }

        let output_pins = self.build_output_pins();
        for pin in &output_pins {
            if let Some(value) = resp.fields.get(&pin.name) {
                let mut pin = pin.clone();
                if let Some(n) = value.as_i64() {
                    pin.value = n as i32;
                } else if let Some(s) = value.as_str() {
                    pin.set_data(s.as_bytes().to_vec(), Some("text/plain".to_owned()));
                }
                if let Err(e) = self.handlers.dispatch_write(&pin) {
                    warn!(pin = %pin.name, error = %e, "write handler failed");
                }
            }
        }

        if !offered.is_empty() {
            if let Some(adapter) = &self.log_return {
                if let Err(e) = adapter.confirm_accepted(&offered, false) {
                    warn!(error = %e, "failed to delete uploaded log-return backups");
                }
            }
        }

        let next_state = match resp.rc {
            request_code::RECONFIGURE => {
                info!("rc=1: reconfigure requested");
                return LoopState::Configure;
            }
            request_code::REBOOT => {
                info!("rc=2: reboot requested");
                self.hooks.reboot();
                LoopState::Run
            }
            request_code::UPGRADE => {
                info!("rc=4: upgrade requested");
                match self.hooks.upgrade().await {
                    Ok(()) => {
                        if let Ok(resp) = self.client.act(&self.identity, Some("Completed"), None).await {
                            self.var_sum = resp.vs;
                        }
                        self.mode = "Completed".to_owned();
                        // Only now, with Completed acknowledged to the
                        // server, let the hook apply/exit (§4.4 step 7).
                        self.hooks.finalize_upgrade();
                    }
                    Err(e) => warn!(error = %e, "upgrade hook failed"),
                }
                LoopState::Run
            }
            _ => LoopState::Run,
        };

        self.sleep_or_cancel(self.monitor_period).await;
        next_state
    }

    fn build_input_pins(&self) -> Vec<Pin> {
        let csv = self.device_config.extra.get("ip").cloned().unwrap_or_default();
        make_pins(&csv, "")
    }

    fn build_output_pins(&self) -> Vec<Pin> {
        let csv = self.device_config.extra.get("op").cloned().unwrap_or_default();
        make_pins(&csv, "")
    }

    /// Sleep for `delay`, observing cancellation. Returns `true` if the
    /// sleep was cut short by a shutdown signal.
    async fn sleep_or_cancel(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.cancel.changed() => {
                debug!("sleep interrupted by cancellation");
                true
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mac", &self.identity.mac)
            .field("mode", &self.mode)
            .field("var_sum", &self.var_sum)
            .finish()
    }
}

/// Merge log-return's freshly-enumerated `T0` pins into `input_pins`.
///
/// A configured `ip` list that names `T0` (the signal `LogReturnAdapter::
/// is_enabled` checks for) produces an unset placeholder pin from
/// `make_pins` alongside any real per-backup pins the adapter offers;
/// without this step both would be sent, duplicating the `T0` query key
/// with a stale `-1` value. The placeholder is dropped in favor of the
/// adapter's real pins (open question (c): `T0` may coexist with other
/// input pins in one cycle — it just must not duplicate itself).
fn merge_log_return_pins(mut input_pins: Vec<Pin>, offered: &[OfferedBackup]) -> Vec<Pin> {
    input_pins.retain(|p| p.name != LOG_RETURN_PIN_NAME);
    input_pins.extend(offered.iter().map(|o| o.pin.clone()));
    input_pins
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            mac: "00:00:00:00:00:01".to_owned(),
            device_key: None,
            client_type: "netsender".to_owned(),
            wifi: None,
            host: Some("http://127.0.0.1:1".to_owned()),
        }
    }

    #[tokio::test]
    async fn new_engine_starts_with_normal_mode_and_zero_var_sum() {
        let (_tx, rx) = watch::channel(false);
        let cfg = EngineConfig {
            config_path: PathBuf::from("/nonexistent/netsender.conf"),
            default_identity: identity(),
            default_monitor_period: Duration::from_secs(30),
            handlers: PinHandlers::new(),
            hooks: Arc::new(NoopHooks),
            log_return: None,
            http_timeout: Duration::from_millis(50),
        };
        let (engine, _handle) = Engine::new(cfg, rx).unwrap();
        assert_eq!(engine.mode(), "Normal");
        assert_eq!(engine.var_sum(), 0);
    }

    #[tokio::test]
    async fn set_mode_is_visible_only_through_pending_queue() {
        let (_tx, rx) = watch::channel(false);
        let cfg = EngineConfig {
            config_path: PathBuf::from("/nonexistent/netsender.conf"),
            default_identity: identity(),
            default_monitor_period: Duration::from_secs(30),
            handlers: PinHandlers::new(),
            hooks: Arc::new(NoopHooks),
            log_return: None,
            http_timeout: Duration::from_millis(50),
        };
        let (engine, handle) = Engine::new(cfg, rx).unwrap();
        handle.set_mode("Paused");
        // Not applied yet -- only visible to the loop at the top of its
        // next cycle.
        assert_eq!(engine.mode(), "Normal");
    }

    #[tokio::test]
    async fn run_exits_cleanly_once_mode_is_observed_as_stopped() {
        let (_tx, rx) = watch::channel(false);
        let cfg = EngineConfig {
            config_path: PathBuf::from("/nonexistent/netsender.conf"),
            default_identity: identity(),
            default_monitor_period: Duration::from_secs(30),
            handlers: PinHandlers::new(),
            hooks: Arc::new(NoopHooks),
            log_return: None,
            http_timeout: Duration::from_millis(50),
        };
        let (mut engine, _handle) = Engine::new(cfg, rx).unwrap();
        engine.mode = "Stopped".to_owned();
        assert!(engine.run().await.is_ok());
    }

    #[test]
    fn merge_log_return_pins_drops_the_unset_placeholder() {
        let mut placeholder = Pin::unset("T0");
        placeholder.value = ns_pins::UNSET;
        let input_pins = vec![Pin::unset("X1"), placeholder];

        let mut real = Pin::unset("T0");
        real.set_data(b"log line".to_vec(), Some("text/plain".to_owned()));
        let offered = vec![ns_logreturn::OfferedBackup {
            path: PathBuf::from("/tmp/app.log.1"),
            pin: real.clone(),
        }];

        let merged = merge_log_return_pins(input_pins, &offered);
        let t0_pins: Vec<&Pin> = merged.iter().filter(|p| p.name == "T0").collect();
        assert_eq!(t0_pins.len(), 1, "exactly one T0 pin should survive the merge");
        assert_eq!(t0_pins[0].value, real.value);
    }

    #[test]
    fn merge_log_return_pins_with_no_offered_backups_still_drops_placeholder() {
        let input_pins = vec![Pin::unset("X1"), Pin::unset("T0")];
        let merged = merge_log_return_pins(input_pins, &[]);
        assert!(!merged.iter().any(|p| p.name == "T0"));
        assert_eq!(merged.len(), 1);
    }
}
