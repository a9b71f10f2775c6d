use anyhow::Context;
use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consentkeeper_backend::{
    config::Config,
    db::connection::{create_pool, StorePools},
    services::retention::RetentionSyncService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consentkeeper_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let retention_url = config
        .retention_database_url
        .clone()
        .context("RETENTION_DATABASE_URL must be set for retention sync")?;

    let live = create_pool(&config.database_url).await?;
    let retention = create_pool(&retention_url).await?;
    sqlx::migrate!("./migrations").run(retention.as_ref()).await?;

    let cutoff = Utc::now().timestamp() - config.retention_cutoff_days * 86_400;
    tracing::info!(
        cutoff,
        statuses = ?config.retention_statuses,
        "starting retention sync"
    );

    let service = RetentionSyncService::new(
        StorePools::new(live, Some(retention)),
        config.retention_statuses.clone(),
    );
    let outcome = service.sync(cutoff).await?;

    tracing::info!(
        moved = outcome.moved,
        skipped = outcome.skipped,
        "retention sync finished"
    );
    Ok(())
}
