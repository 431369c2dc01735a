use anyhow::Context;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use gitboard::config::ServiceConfig;
use gitboard::ForumService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds; release deployments set
    // the environment themselves.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let config = ServiceConfig::from_env();
    info!(
        repo = %config.repo_path.display(),
        remote = %config.sync.remote,
        interval_secs = config.sync_interval.as_secs(),
        "bootstrapping gitboard-syncd"
    );

    let service = ForumService::open(config.clone())
        .with_context(|| format!("open forum at {}", config.repo_path.display()))?;
    let status = service.status().await.context("read forum status")?;
    if !status.initialized {
        anyhow::bail!("{} is not a forum repository", config.repo_path.display());
    }
    info!(forum = %status.forum_name, user = ?status.username, admin = status.is_admin, "forum opened");

    let mut ticker = tokio::time::interval(config.sync_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match service.sync().await {
                    Ok(report) => info!(
                        pulled = ?report.pulled,
                        approved = report.approved.len(),
                        pushed = report.pushed,
                        "sync complete"
                    ),
                    // local content stays readable; try again next tick
                    Err(e) => warn!(error = %e, "sync failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }
    Ok(())
}
