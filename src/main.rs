// netsender: the device-side CLI binary. Wires C1-C5 (config store,
// HTTP layer, pin registry, reconciliation loop, log-return adapter)
// into one running process and owns process-level concerns (tracing
// init, signal handling, exit codes) that the library crates don't.

use clap::Parser;
use netsender::cli::Args;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "netsender starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match netsender::run(args, shutdown_rx).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    }
}
