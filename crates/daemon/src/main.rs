// hubsyncd: hub-of-hubs git storage sync daemon.

use anyhow::Context;
use hubsync_daemon::config::{LogFormat, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SyncConfig::from_env().context("invalid hubsync configuration")?;
    init_tracing(&config)?;

    info!(
        root = %config.git_storage_root.display(),
        interval = %humantime::format_duration(config.sync_interval),
        "starting hubsync daemon"
    );
    hubsync_daemon::runtime::run(config).await.context("hubsync daemon terminated unexpectedly")
}

fn init_tracing(config: &SyncConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid log filter `{}`", config.log_filter))?;
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Plain => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
    Ok(())
}
