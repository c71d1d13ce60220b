//! Portal entry point.

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use agentwire::api::routes;
use agentwire::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("AGENTWIRE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = args.next().map(PathBuf::from);
            }
            "--help" | "-h" => {
                println!("agentwire [--config <agentwire.yaml>]");
                return Ok(());
            }
            other => {
                anyhow::bail!("unknown argument '{}'", other);
            }
        }
    }

    let config = Config::load(config_path.as_deref())?;
    routes::serve(config).await
}
