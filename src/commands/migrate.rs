use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::database::{create_pool, run_migrations};

pub async fn handle_migrate(config: &AppConfig) -> Result<()> {
    let pool = create_pool(config.database_url()?, 1)?;
    let applied = tokio::task::spawn_blocking(move || run_migrations(&pool)).await??;

    if applied == 0 {
        info!("Database schema is up to date");
    } else {
        info!("Applied {} migration(s)", applied);
    }
    Ok(())
}
