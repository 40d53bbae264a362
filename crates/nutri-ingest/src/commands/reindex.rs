//! `reindex` command

use crate::config::{DatabaseSettings, SearchSettings};
use crate::search_index::SearchIndexer;
use crate::sink::postgres;
use anyhow::Context;
use sqlx::{Connection, PgConnection};
use tracing::info;

/// Recreate the search index and fill it from the food table
pub async fn run(es_url: Option<String>, index: Option<String>) -> anyhow::Result<usize> {
    let mut search = SearchSettings::from_env()?;
    if let Some(url) = es_url {
        search.url = url;
    }
    if let Some(index) = index {
        search.index = index;
    }

    let database = DatabaseSettings::from_env()?;
    let mut conn = PgConnection::connect_with(database.options())
        .await
        .with_context(|| format!("failed to connect to {}", database.target()))?;

    let indexer = SearchIndexer::new(&search)?;
    info!(url = %search.url, index = %search.index, "Recreating search index");
    indexer.recreate().await.context("failed to recreate search index")?;

    let indexed = indexer
        .publish(postgres::index_documents(&mut conn))
        .await
        .context("failed to publish foods to search index")?;

    conn.close().await?;
    Ok(indexed)
}
