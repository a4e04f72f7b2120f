//! netsender: the device-side CLI binary wiring C1-C5 into one running
//! reconciliation loop.
//!
//! Library entry point — exposed mainly so integration tests can drive
//! [`run`] against a mock NetReceiver instead of a real cloud service.

pub mod cli;
pub mod hardware;
pub mod hooks;

use std::sync::Arc;
use std::time::Duration;

use ns_core::{ControlHooks, Engine, EngineConfig, EngineError, NoopHooks};
use ns_logreturn::LogReturnAdapter;
use tokio::sync::watch;
use tracing::{error, info};

pub use cli::Args;
pub use hooks::UpdaterHooks;

/// Build the engine described by `args` and run its reconciliation loop
/// until `cancel` fires or the server sets mode to `Stopped`. Returns the
/// error the loop exited with, if any — a clean shutdown via cancellation
/// surfaces as `EngineError::Cancelled`, which callers should treat as
/// success alongside the `Stopped`-mode exit (already `Ok(())`).
pub async fn run(args: Args, cancel: watch::Receiver<bool>) -> Result<(), EngineError> {
    let default_identity = args.identity_seed();

    let handlers = if args.hardware {
        hardware::live_handlers()
    } else {
        hardware::simulated_handlers()
    };

    let log_return = args
        .log_dir
        .clone()
        .map(|dir| LogReturnAdapter::new(dir, args.log_prefix.clone()));

    let hooks: Arc<dyn ControlHooks> = if args.self_update {
        let updater = UpdaterHooks::new(
            args.update_repo_owner.clone(),
            args.update_repo_name.clone(),
            args.client_type.clone(),
            env!("CARGO_PKG_VERSION"),
        )
        .map_err(|e| EngineError::Hooks(e.to_string()))?;
        Arc::new(updater)
    } else {
        Arc::new(NoopHooks)
    };

    let cfg = EngineConfig {
        config_path: args.config.clone(),
        default_identity,
        default_monitor_period: Duration::from_secs(args.default_monitor_period),
        handlers,
        hooks,
        log_return,
        http_timeout: Duration::from_secs(args.http_timeout_secs),
    };

    let (mut engine, _handle) = Engine::new(cfg, cancel)?;
    info!(mac = %args.mac, "netsender starting reconciliation loop");
    match engine.run().await {
        Ok(()) => Ok(()),
        Err(EngineError::Cancelled) => {
            info!("netsender shut down cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "netsender exiting on fatal error");
            Err(e)
        }
    }
}
