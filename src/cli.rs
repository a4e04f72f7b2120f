//! Command-line surface (§6 "CLI surface"): a log-level flag, a
//! hardware-enable flag, and a config path override, plus the
//! variant-specific passthrough flags a router-monitoring build would
//! use. Hardware implementation for those flags remains out of scope
//! (§1 Non-goals); they are parsed and stored so a variant build can
//! read them back out of [`Args`].

use std::path::PathBuf;

use clap::Parser;
use ns_protocol::Identity;

#[derive(Parser, Debug, Clone)]
#[command(name = "netsender", about = "NetSender client protocol engine")]
pub struct Args {
    /// Tracing filter, e.g. "info", "debug", "netsender=trace".
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Enable real hardware pin handlers instead of the simulated set.
    #[arg(long, default_value_t = false)]
    pub hardware: bool,

    /// Path to the persisted device config file.
    #[arg(long, default_value = "/etc/netsender/netsender.conf")]
    pub config: PathBuf,

    /// MAC-style identifier used until a configure reply assigns one.
    #[arg(long, default_value = "000000000000")]
    pub mac: String,

    /// Client type string sent on `/config` (e.g. "netsender", "weather").
    #[arg(long, default_value = "netsender")]
    pub client_type: String,

    /// Override the well-known production NetReceiver host.
    #[arg(long)]
    pub host: Option<String>,

    /// Monitor period used before the server has ever assigned one.
    #[arg(long, default_value_t = 30)]
    pub default_monitor_period: u64,

    /// Per-request HTTP timeout.
    #[arg(long, default_value_t = 5)]
    pub http_timeout_secs: u64,

    /// Directory rotated log backups live in, for the log-return adapter.
    /// Absent disables log-return entirely.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Filename prefix identifying rotated log backups within `log_dir`.
    #[arg(long, default_value = "netsender.log.")]
    pub log_prefix: String,

    /// Router-monitoring variant: SSH target host. Parsed and stored;
    /// the SSH-to-router shell adapter itself is out of scope (§1).
    #[arg(long)]
    pub ssh_host: Option<String>,

    /// Router-monitoring variant: SSH username.
    #[arg(long)]
    pub ssh_user: Option<String>,

    /// Enable GitHub-Releases self-update in response to rc=4. Disabled
    /// by default since not every variant ships release archives.
    #[arg(long, default_value_t = false)]
    pub self_update: bool,

    /// GitHub repository owner self-update releases are published under.
    #[arg(long, default_value = "ausocean")]
    pub update_repo_owner: String,

    /// GitHub repository name self-update releases are published under.
    #[arg(long, default_value = "netsender")]
    pub update_repo_name: String,
}

impl Args {
    pub fn identity_seed(&self) -> Identity {
        Identity {
            mac: self.mac.clone(),
            device_key: None,
            client_type: self.client_type.clone(),
            wifi: None,
            host: self.host.clone(),
        }
    }
}
