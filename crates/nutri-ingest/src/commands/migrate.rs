//! `migrate` command

use crate::config::DatabaseSettings;
use anyhow::Context;
use sqlx::{Connection, PgConnection};
use tracing::info;

/// Apply the bundled migrations under `migrations/`
pub async fn run() -> anyhow::Result<()> {
    let database = DatabaseSettings::from_env()?;
    let mut conn = PgConnection::connect_with(database.options())
        .await
        .with_context(|| format!("failed to connect to {}", database.target()))?;

    sqlx::migrate!("./migrations")
        .run(&mut conn)
        .await
        .context("failed to apply migrations")?;

    info!(database = %database.target(), "Food tables are up to date");
    conn.close().await?;
    Ok(())
}
