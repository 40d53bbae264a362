//! PostgreSQL sink
//!
//! Each worker holds its own connection and writes every batch inside one
//! transaction: a failure anywhere rolls the whole batch back. Foods are
//! upserted on `source_id`; records whose natural key already exists only
//! add measurements and barcodes to the canonical row.
//!
//! Before resolving natural keys a transaction takes a transaction-scoped
//! advisory lock per key it may create, in hash order. Two processes
//! loading the same food therefore serialize, and the second one finds the
//! row the first committed.
//!
//! The expected tables are in `migrations/0001_food_tables.sql`.

use super::{BatchReceipt, PortionStore, Sink, SinkFactory};
use crate::batch::Batch;
use crate::dedup::{DuplicateGroup, MergeTotals};
use crate::error::SinkError;
use crate::match_cache::MatchCache;
use crate::record::{Measurement, NaturalKey, NormalizedRecord, SinkId};
use crate::search_index::IndexDocument;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use sqlx::postgres::PgConnectOptions;
use sqlx::types::Json;
use sqlx::{Connection, PgConnection, Postgres, Transaction};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Identities are handed to the match cache in pages of this size
pub const WARM_PAGE_SIZE: usize = 10_000;

/// Columns the sink writes, per table
pub const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "food",
        &["id", "source_id", "name", "brand", "food_group", "calories", "is_csv_food", "nutrients"],
    ),
    (
        "food_measurement",
        &["food_id", "name", "abbreviation", "unit", "weight_in_grams", "is_default", "is_from_source"],
    ),
    ("food_barcode", &["barcode", "food_id"]),
];

/// Map a driver error to an error class
///
/// Authentication and permission failures are fatal. Serialization
/// conflicts, deadlocks, connection loss and pool exhaustion are
/// transient. Everything else rejects the batch.
pub fn classify(err: sqlx::Error) -> SinkError {
    let message = format!("database error: {err}");
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            match code.as_str() {
                "28000" | "28P01" | "42501" => SinkError::Fatal(message),
                "40001" | "40P01" | "53300" | "57P01" | "57P03" => SinkError::Transient(message),
                c if c.starts_with("08") => SinkError::Transient(message),
                _ => SinkError::Rejected(message),
            }
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SinkError::Transient(message),
        _ => SinkError::Rejected(message),
    }
}

/// Check that every table and column the sink writes exists
pub async fn verify_schema(conn: &mut PgConnection) -> anyhow::Result<()> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT table_name::text, column_name::text
        FROM information_schema.columns
        WHERE table_schema = current_schema()
          AND table_name IN ('food', 'food_measurement', 'food_barcode')
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .flat_map(|(table, columns)| columns.iter().map(move |column| (*table, *column)))
        .filter(|(table, column)| !rows.iter().any(|(t, c)| t == table && c == column))
        .map(|(table, column)| format!("{table}.{column}"))
        .collect();

    if !missing.is_empty() {
        anyhow::bail!("database schema is missing column(s): {}", missing.join(", "));
    }
    Ok(())
}

/// `(natural key, id)` of every food, lowest id first
pub async fn food_identities(conn: &mut PgConnection) -> Result<Vec<(NaturalKey, SinkId)>, sqlx::Error> {
    sqlx::query_as::<_, (i64, String, i32)>("SELECT id, name, calories FROM food ORDER BY id")
        .fetch(&mut *conn)
        .map_ok(|(id, name, calories)| (NaturalKey::new(&name, i64::from(calories)), SinkId(id)))
        .try_collect()
        .await
}

/// Fold the foods of `group` into its canonical food, in one transaction.
///
/// Measurements whose abbreviation the canonical food already has are
/// dropped; among duplicates sharing an abbreviation the oldest row moves.
pub async fn merge_group(conn: &mut PgConnection, group: &DuplicateGroup) -> Result<MergeTotals, sqlx::Error> {
    let canonical = group.canonical.0;
    let duplicates = group.duplicate_ids();
    let mut tx = conn.begin().await?;
    lock_keys(&mut tx, &[group.key.to_string()]).await?;

    let shadowed = sqlx::query(
        r#"
        DELETE FROM food_measurement d
        USING food_measurement c
        WHERE d.food_id = ANY($2) AND c.food_id = $1 AND c.abbreviation = d.abbreviation
        "#,
    )
    .bind(canonical)
    .bind(&duplicates)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let repeated = sqlx::query(
        r#"
        DELETE FROM food_measurement d
        USING food_measurement k
        WHERE d.food_id = ANY($1) AND k.food_id = ANY($1)
          AND k.abbreviation = d.abbreviation AND k.id < d.id
        "#,
    )
    .bind(&duplicates)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let moved = sqlx::query("UPDATE food_measurement SET food_id = $1 WHERE food_id = ANY($2)")
        .bind(canonical)
        .bind(&duplicates)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let barcodes = sqlx::query("UPDATE food_barcode SET food_id = $1 WHERE food_id = ANY($2)")
        .bind(canonical)
        .bind(&duplicates)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let removed = sqlx::query("DELETE FROM food WHERE id = ANY($1)")
        .bind(&duplicates)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    Ok(MergeTotals {
        groups: 1,
        foods_removed: removed,
        measurements_moved: moved,
        measurements_dropped: shadowed + repeated,
        barcodes_moved: barcodes,
    })
}

/// Load every existing food identity into `matches`, lowest id first
pub async fn warm_match_cache(conn: &mut PgConnection, matches: &MatchCache) -> Result<usize, sqlx::Error> {
    let mut rows = sqlx::query_as::<_, (i64, String, i32)>("SELECT id, name, calories FROM food ORDER BY id")
        .fetch(&mut *conn);

    let mut page = Vec::with_capacity(WARM_PAGE_SIZE);
    let mut loaded = 0;
    while let Some((id, name, calories)) = rows.try_next().await? {
        page.push((NaturalKey::new(&name, i64::from(calories)), SinkId(id)));
        if page.len() >= WARM_PAGE_SIZE {
            loaded += matches.warm(page.drain(..));
        }
    }
    loaded += matches.warm(page);

    info!(identities = loaded, "Match cache warmed from database");
    Ok(loaded)
}

/// Stream every food as a search document, in id order
pub fn index_documents(conn: &mut PgConnection) -> impl Stream<Item = Result<IndexDocument, sqlx::Error>> + '_ {
    sqlx::query_as::<_, (i64, String, Option<String>, bool)>(
        "SELECT id, name, brand, is_csv_food FROM food ORDER BY id",
    )
    .fetch(conn)
    .map_ok(|(id, name, brand, is_csv_food)| IndexDocument {
        id,
        name,
        brand,
        is_csv_food,
    })
}

/// Creates one [`PostgresSink`] per worker, each with its own connection
#[derive(Debug, Clone)]
pub struct PostgresSinkFactory {
    options: PgConnectOptions,
}

impl PostgresSinkFactory {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SinkFactory for PostgresSinkFactory {
    type Sink = PostgresSink;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self, worker: usize) -> Result<PostgresSink, SinkError> {
        let conn = PgConnection::connect_with(&self.options).await.map_err(classify)?;
        debug!(worker, "Database sink connected");
        Ok(PostgresSink { conn })
    }
}

#[derive(Debug)]
pub struct PostgresSink {
    conn: PgConnection,
}

#[async_trait]
impl Sink for PostgresSink {
    async fn write_batch(&mut self, batch: &Batch, matches: &MatchCache) -> Result<BatchReceipt, SinkError> {
        let mut tx = self.conn.begin().await.map_err(classify)?;

        match write_records(&mut tx, batch, matches).await {
            Ok(receipt) => {
                tx.commit().await.map_err(classify)?;
                Ok(receipt)
            },
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(batch_id = batch.id(), error = %rollback, "Rollback failed");
                }
                Err(classify(e))
            },
        }
    }
}

async fn write_records(
    tx: &mut Transaction<'_, Postgres>,
    batch: &Batch,
    matches: &MatchCache,
) -> Result<BatchReceipt, sqlx::Error> {
    let mut receipt = BatchReceipt::default();
    let mut created_here: HashMap<NaturalKey, SinkId> = HashMap::new();

    lock_keys(tx, &creation_keys(batch)).await?;

    for record in batch.records() {
        let key = &record.natural_key;
        let known = record
            .matched
            .or_else(|| created_here.get(key).copied())
            .or_else(|| matches.lookup(key));

        let known = match known {
            Some(id) => Some(id),
            None => find_by_natural_key(tx, key).await?,
        };

        let food_id = match known {
            Some(id) => {
                receipt.matched += 1;
                id
            },
            None => {
                let id = upsert_food(tx, record).await?;
                created_here.insert(key.clone(), id);
                receipt.created.push((key.clone(), id));
                id
            },
        };

        for measurement in &record.measurements {
            insert_measurement(tx, food_id, measurement).await?;
        }
        if let Some(barcode) = &record.barcode {
            upsert_barcode(tx, barcode, food_id).await?;
        }
    }

    Ok(receipt)
}

/// Natural keys `batch` may create a food for, distinct and sorted
fn creation_keys(batch: &Batch) -> Vec<String> {
    let mut keys: Vec<String> = batch
        .records()
        .iter()
        .filter(|record| record.matched.is_none())
        .map(|record| record.natural_key.to_string())
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

/// Take a transaction-scoped advisory lock for each distinct key, ordered by lock id
async fn lock_keys(tx: &mut Transaction<'_, Postgres>, keys: &[String]) -> Result<(), sqlx::Error> {
    if keys.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        SELECT pg_advisory_xact_lock(lock_id)
        FROM (
            SELECT DISTINCT hashtextextended(key, 0) AS lock_id
            FROM unnest($1::text[]) AS key
            ORDER BY lock_id
        ) AS ordered
        "#,
    )
    .bind(keys)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn find_by_natural_key(
    tx: &mut Transaction<'_, Postgres>,
    key: &NaturalKey,
) -> Result<Option<SinkId>, sqlx::Error> {
    let id: Option<i64> =
        sqlx::query_scalar("SELECT id FROM food WHERE lower(name) = $1 AND calories = $2 ORDER BY id LIMIT 1")
            .bind(key.name())
            .bind(key.magnitude())
            .fetch_optional(&mut **tx)
            .await?;
    Ok(id.map(SinkId))
}

async fn upsert_food(tx: &mut Transaction<'_, Postgres>, record: &NormalizedRecord) -> Result<SinkId, sqlx::Error> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO food (source_id, name, brand, food_group, calories, is_csv_food, nutrients)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (source_id) DO UPDATE SET
            name = EXCLUDED.name,
            brand = EXCLUDED.brand,
            food_group = EXCLUDED.food_group,
            calories = EXCLUDED.calories,
            is_csv_food = food.is_csv_food OR EXCLUDED.is_csv_food,
            nutrients = EXCLUDED.nutrients,
            updated_at = NOW()
        RETURNING id
        "#,
    )
    .bind(&record.source_id)
    .bind(&record.name)
    .bind(record.brand.as_deref())
    .bind(record.food_group.as_deref())
    .bind(record.calories)
    .bind(record.is_csv_food)
    .bind(Json(&record.nutrients))
    .fetch_one(&mut **tx)
    .await?;
    Ok(SinkId(id))
}

/// Returns whether a row was added
async fn insert_measurement(
    tx: &mut Transaction<'_, Postgres>,
    food_id: SinkId,
    measurement: &Measurement,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO food_measurement (food_id, name, abbreviation, unit, weight_in_grams, is_default, is_from_source)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (food_id, abbreviation) DO NOTHING
        "#,
    )
    .bind(food_id.0)
    .bind(&measurement.name)
    .bind(&measurement.abbreviation)
    .bind(&measurement.unit)
    .bind(measurement.weight_in_grams)
    .bind(measurement.is_default)
    .bind(measurement.is_from_source)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn upsert_barcode(tx: &mut Transaction<'_, Postgres>, barcode: &str, food_id: SinkId) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO food_barcode (barcode, food_id)
        VALUES ($1, $2)
        ON CONFLICT (barcode) DO UPDATE SET food_id = EXCLUDED.food_id
        "#,
    )
    .bind(barcode)
    .bind(food_id.0)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// [`PortionStore`] over one database connection
#[derive(Debug)]
pub struct PostgresPortionStore {
    conn: PgConnection,
}

impl PostgresPortionStore {
    pub async fn connect(options: &PgConnectOptions) -> Result<Self, SinkError> {
        let conn = PgConnection::connect_with(options).await.map_err(classify)?;
        Ok(Self { conn })
    }

    pub async fn close(self) -> Result<(), sqlx::Error> {
        self.conn.close().await
    }
}

#[async_trait]
impl PortionStore for PostgresPortionStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn food_ids(&mut self, source_ids: &[String]) -> Result<HashMap<String, SinkId>, SinkError> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT source_id, id FROM food WHERE source_id = ANY($1)")
            .bind(source_ids)
            .fetch_all(&mut self.conn)
            .await
            .map_err(classify)?;
        Ok(rows.into_iter().map(|(source_id, id)| (source_id, SinkId(id))).collect())
    }

    async fn attach(&mut self, portions: &[(SinkId, Measurement)]) -> Result<u64, SinkError> {
        let mut tx = self.conn.begin().await.map_err(classify)?;
        let mut added = 0;
        for (food_id, measurement) in portions {
            match insert_measurement(&mut tx, *food_id, measurement).await {
                Ok(inserted) => added += u64::from(inserted),
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "Rollback failed");
                    }
                    return Err(classify(e));
                },
            }
        }
        tx.commit().await.map_err(classify)?;
        Ok(added)
    }
}
