//! Standalone TermWeave server binary. Run with --port and --assets, or use
//! defaults.

use std::path::PathBuf;

use common::config;

const DEFAULT_PORT: u16 = 5183;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let _ = config::ensure_loaded();

    let mut port = DEFAULT_PORT;
    let mut assets: Option<PathBuf> = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().unwrap_or(DEFAULT_PORT);
            i += 2;
            continue;
        }
        if args[i] == "--assets" && i + 1 < args.len() {
            assets = Some(PathBuf::from(&args[i + 1]));
            i += 2;
            continue;
        }
        i += 1;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(server::run_server(port, assets))
}
