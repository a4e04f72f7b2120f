// spoofer: a standalone mock NetReceiver, for manually exercising a
// NetSender device binary against something other than the production
// cloud service. Same role `services/emulator` plays for the timing
// hardware protocol: a harness binary next to the real client, not part
// of its library surface.

use clap::Parser;
use ns_test_utils::MockNetReceiver;
use tracing::info;

#[derive(Parser)]
#[command(name = "spoofer", about = "Mock NetReceiver for manual testing")]
struct Args {
    /// Port to bind on (0 picks a random free port).
    #[arg(short, long, default_value_t = 8290)]
    port: u16,

    /// Device key handed back on `/config`.
    #[arg(short = 'k', long, default_value_t = 10_000_001)]
    device_key: u32,

    /// Seed variables, as repeated `key=value` pairs.
    #[arg(long = "var", value_parser = parse_key_value)]
    vars: Vec<(String, String)>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let server = MockNetReceiver::bind(&format!("127.0.0.1:{}", args.port), args.device_key)
        .await
        .expect("failed to bind spoofer listener");
    if !args.vars.is_empty() {
        server.set_vars(args.vars);
    }

    info!(url = %server.base_url(), "spoofer listening");
    info!("press ctrl-c to stop");

    tokio::signal::ctrl_c().await.ok();
    info!("spoofer shutting down");
}
