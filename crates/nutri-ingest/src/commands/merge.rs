//! `merge-duplicates` command

use crate::config::DatabaseSettings;
use crate::dedup::{find_duplicates, MergeTotals};
use crate::sink::postgres;
use anyhow::Context;
use sqlx::{Connection, PgConnection};
use tracing::{debug, info};

/// Fold foods sharing a natural key into the oldest of them
pub async fn run(dry_run: bool) -> anyhow::Result<MergeTotals> {
    let database = DatabaseSettings::from_env()?;
    let mut conn = PgConnection::connect_with(database.options())
        .await
        .with_context(|| format!("failed to connect to {}", database.target()))?;
    postgres::verify_schema(&mut conn).await?;

    let identities = postgres::food_identities(&mut conn)
        .await
        .context("failed to load foods")?;
    let foods = identities.len();
    let groups = find_duplicates(identities);
    info!(foods, groups = groups.len(), "Duplicate foods found");

    let totals = if dry_run {
        for group in &groups {
            debug!(key = %group.key, canonical = group.canonical.0, duplicates = ?group.duplicate_ids(), "Would merge");
        }
        MergeTotals::planned(&groups)
    } else {
        let mut totals = MergeTotals::default();
        for group in &groups {
            let merged = postgres::merge_group(&mut conn, group)
                .await
                .with_context(|| format!("failed to merge foods of {}", group.key))?;
            debug!(key = %group.key, canonical = group.canonical.0, removed = merged.foods_removed, "Merged");
            totals.add(&merged);
        }
        totals
    };
    conn.close().await?;

    info!(
        dry_run,
        groups = totals.groups,
        foods_removed = totals.foods_removed,
        measurements_moved = totals.measurements_moved,
        measurements_dropped = totals.measurements_dropped,
        barcodes_moved = totals.barcodes_moved,
        "Duplicate merge finished"
    );
    Ok(totals)
}
