//! `ControlHooks` implementations for rc=2/4 (§4.4 step 7). The default
//! build wires `ns-updater`'s GitHub Releases checker behind the
//! reconciliation loop's upgrade hook; a variant with no self-update
//! mechanism can fall back to `ns_core::NoopHooks` instead.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin as StdPin;
use std::sync::Mutex;

use ns_core::ControlHooks;
use ns_updater::{UpdateChecker, UpdateStatus};
use tracing::{info, warn};

/// Backs rc=2 (reboot) and rc=4 (upgrade) with a real self-update check
/// against GitHub Releases. Reboot has no hardware-specific mechanism in
/// scope (§1 Non-goals), so it degrades to a clean process exit for a
/// supervisor (systemd, a container runtime) to restart — the same
/// "exit so something else restarts us" idiom `UpdateChecker::
/// apply_and_exit` uses for a completed upgrade.
///
/// `upgrade` only checks and stages a new release; it never exits the
/// process. The staged path is handed to `finalize_upgrade`, which the
/// engine calls only once the `md=Completed` Act push has gone out
/// (§4.4 step 7) — that call is the one that actually replaces the
/// running binary and exits.
pub struct UpdaterHooks {
    checker: UpdateChecker,
    staged: Mutex<Option<PathBuf>>,
}

impl UpdaterHooks {
    pub fn new(
        repo_owner: impl Into<String>,
        repo_name: impl Into<String>,
        client_type: impl Into<String>,
        current_version: &str,
    ) -> Result<Self, semver::Error> {
        let checker = UpdateChecker::new(repo_owner, repo_name, client_type, current_version)?;
        Ok(UpdaterHooks {
            checker,
            staged: Mutex::new(None),
        })
    }
}

impl ControlHooks for UpdaterHooks {
    fn reboot(&self) {
        info!("rc=2: exiting process so a supervisor can restart it");
        std::process::exit(0);
    }

    fn upgrade<'a>(&'a self) -> StdPin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            match self.checker.check().await.map_err(|e| e.to_string())? {
                UpdateStatus::UpToDate => {
                    info!("rc=4: already up to date, nothing to apply");
                    Ok(())
                }
                UpdateStatus::Available { version } | UpdateStatus::Downloaded { version } => {
                    let staged = self
                        .checker
                        .download(&version)
                        .await
                        .map_err(|e| e.to_string())?;
                    *self.staged.lock().expect("staged mutex poisoned") = Some(staged);
                    info!(%version, "rc=4: update staged, deferring apply until Act confirms Completed");
                    Ok(())
                }
            }
        })
    }

    fn finalize_upgrade(&self) {
        let staged = self.staged.lock().expect("staged mutex poisoned").take();
        let Some(staged) = staged else {
            return;
        };
        // apply_and_exit only returns on failure; success exits the
        // process directly.
        if let Err(e) = UpdateChecker::apply_and_exit(&staged) {
            warn!(error = %e, "failed to apply staged update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_current_version() {
        let hooks = UpdaterHooks::new("owner", "repo", "netsender", "not-a-version");
        assert!(hooks.is_err());
    }

    #[test]
    fn finalize_upgrade_is_a_noop_without_a_staged_update() {
        let hooks = UpdaterHooks::new("owner", "repo", "netsender", "1.0.0").unwrap();
        hooks.finalize_upgrade();
    }
}
