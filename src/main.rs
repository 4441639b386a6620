//! Vibez agent server entry point.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vibez_agent::{api, config::Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,vibez_agent=debug"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        workspaces_root = %config.workspaces_root.display(),
        dev_mode = config.dev_mode,
        "Starting Vibez agent server"
    );

    api::serve(config).await
}
