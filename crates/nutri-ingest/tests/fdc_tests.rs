//! FoodData Central foods and portions against the in-memory store

#![allow(clippy::unwrap_used, clippy::expect_used)]

use nutri_ingest::commands::fdc;
use nutri_ingest::config::PipelineSettings;
use nutri_ingest::normalize::clean::TextCleaner;
use nutri_ingest::normalize::fdc::{open_nutrients, FdcCatalog, FdcNormalizer, PortionNormalizer, FOOD_PORTION_FILE};
use nutri_ingest::normalize::Normalizer;
use nutri_ingest::pipeline::{Pipeline, EXIT_COMPLETED};
use nutri_ingest::portions::PortionStage;
use nutri_ingest::sink::memory::{MemorySinkFactory, MemoryStore};
use nutri_ingest::source::{CsvSource, SourceOptions};
use nutri_ingest::{FdcStage, PipelineArgs};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A small release: two foods, a repeat of the first, one food missing from food.csv
fn release() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let files = [
        ("nutrient.csv", "id,name,unit_name\n1008,Energy,KCAL\n1003,Protein,G\n1004,Total lipid (fat),G\n"),
        (
            "food.csv",
            "fdc_id,data_type,description\n100,foundation_food,\"Apples, raw\"\n200,branded_food,Greek Yogurt\n300,sr_legacy_food,\"APPLES, RAW\"\n",
        ),
        (
            "food_nutrient.csv",
            "id,fdc_id,nutrient_id,amount\n1,100,1008,52\n2,100,1003,0.3\n3,200,1008,97\n4,200,1003,9\n5,300,1008,52\n6,999,1008,10\n",
        ),
        (
            "branded_food.csv",
            "fdc_id,brand_owner,gtin_upc,serving_size,serving_size_unit,household_serving_fulltext\n200,Acme Dairy,00012345,170,g,1 container\n",
        ),
        ("measure_unit.csv", "id,name\n1000,cup\n"),
        (
            FOOD_PORTION_FILE,
            "id,fdc_id,amount,measure_unit_id,portion_description,modifier,gram_weight\n1,100,1,1000,,,125\n2,999,1,1000,,,50\n3,200,1,,,,0\n",
        ),
    ];
    for (name, contents) in files {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }
    dir
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        batch_size: 2,
        workers: 2,
        max_inflight: 2,
        retry_backoff_ms: 1,
        ..PipelineSettings::default()
    }
}

async fn load_foods(dir: &Path, store: &MemoryStore) -> nutri_ingest::RunReport {
    let catalog = FdcCatalog::load(dir, &TextCleaner::new().unwrap()).unwrap();
    let normalizer: Arc<dyn Normalizer> = Arc::new(FdcNormalizer::new(Arc::new(catalog)).unwrap());
    let source = open_nutrients(dir, SourceOptions::csv()).unwrap();
    Pipeline::new(settings())
        .run(source, normalizer, &MemorySinkFactory::new(store.clone()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_foods_pivoted_and_deduplicated() {
    let dir = release();
    let store = MemoryStore::new();

    let report = load_foods(dir.path(), &store).await;

    assert!(report.is_completed());
    assert_eq!(report.dataset, "fdc");
    assert!(report.totals.is_balanced());
    assert_eq!(report.totals.rows_scanned, 4);
    assert_eq!(report.totals.skipped_by_reason.get("not_in_catalog"), Some(&1));
    assert_eq!(report.totals.records_created, 2);
    assert_eq!(report.totals.records_matched, 1);

    let foods = store.foods();
    assert_eq!(foods.len(), 2);
    let apple = &foods[0];
    assert_eq!(apple.record.source_id, "100");
    assert_eq!(apple.record.calories, 52);
    assert!((apple.record.nutrients.protein - 0.3).abs() < 1e-9);
    assert!(apple.record.is_csv_food);

    let yogurt = &foods[1];
    assert_eq!(yogurt.record.brand.as_deref(), Some("Acme Dairy"));
    let serving = yogurt.measurements.iter().find(|m| m.name == "1 container").unwrap();
    assert_eq!(serving.weight_in_grams, 170.0);
}

#[tokio::test]
async fn test_portions_follow_imported_foods() {
    let dir = release();
    let mut store = MemoryStore::new();
    load_foods(dir.path(), &store).await;

    let normalizer = Arc::new(PortionNormalizer::load(dir.path()).unwrap());
    let source = CsvSource::open(dir.path().join(FOOD_PORTION_FILE), SourceOptions::csv()).unwrap();
    let report = PortionStage::new(settings())
        .run(source, normalizer, &mut store)
        .await
        .unwrap();

    assert!(report.is_completed());
    assert_eq!(report.dataset, "fdc-portions");
    assert!(report.totals.is_balanced());
    assert_eq!(report.totals.rows_scanned, 3);
    assert_eq!(report.totals.rows_succeeded, 1);
    assert_eq!(report.totals.skipped_by_reason.get("unknown_food"), Some(&1));
    assert_eq!(report.totals.skipped_by_reason.get("invalid_portion"), Some(&1));

    let apple = &store.foods()[0];
    let cup = apple.measurements.iter().find(|m| m.name == "1 cup").unwrap();
    assert_eq!(cup.weight_in_grams, 125.0);
    assert_eq!(cup.unit, "cup");
}

#[tokio::test]
async fn test_dry_run_runs_both_stages() {
    let dir = release();
    let outcome = fdc::run(
        dir.path(),
        FdcStage::All,
        true,
        &PipelineArgs::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.exit_code(), EXIT_COMPLETED);
    assert_eq!(outcome.foods.unwrap().totals.records_created, 2);
    assert_eq!(outcome.portions.unwrap().totals.rows_succeeded, 1);
}

#[tokio::test]
async fn test_missing_release_file_is_setup_error() {
    let dir = release();
    std::fs::remove_file(dir.path().join("food.csv")).unwrap();

    let err = fdc::run(
        dir.path(),
        FdcStage::Foods,
        true,
        &PipelineArgs::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("food.csv"));
}
