//! `fdc` command: FoodData Central foods, then their portions

use super::ingest::run_database;
use crate::config::{DatabaseSettings, PipelineSettings};
use crate::normalize::clean::TextCleaner;
use crate::normalize::fdc::{self, FdcCatalog, FdcNormalizer, PortionNormalizer};
use crate::normalize::Normalizer;
use crate::pipeline::{Pipeline, RunReport, EXIT_COMPLETED};
use crate::portions::PortionStage;
use crate::sink::memory::{MemorySinkFactory, MemoryStore};
use crate::sink::postgres::PostgresPortionStore;
use crate::source::{CsvSource, PivotRows, SourceOptions};
use crate::{FdcStage, PipelineArgs};
use anyhow::Context;
use std::fs::File;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reports of the stages that ran
#[derive(Debug, Default)]
pub struct FdcRun {
    pub foods: Option<RunReport>,
    pub portions: Option<RunReport>,
}

impl FdcRun {
    /// Worst exit status of the stages that ran
    pub fn exit_code(&self) -> u8 {
        [&self.foods, &self.portions]
            .into_iter()
            .flatten()
            .map(RunReport::exit_code)
            .max()
            .unwrap_or(EXIT_COMPLETED)
    }

    fn foods_aborted(&self) -> bool {
        self.foods.as_ref().is_some_and(|report| !report.is_completed())
    }
}

pub async fn run(
    dir: &Path,
    stage: FdcStage,
    dry_run: bool,
    args: &PipelineArgs,
    cancel: CancellationToken,
) -> anyhow::Result<FdcRun> {
    let settings = args.apply(PipelineSettings::from_env()?)?;
    let progress = std::io::stderr().is_terminal();
    let mut outcome = FdcRun::default();

    if dry_run {
        info!(dir = %dir.display(), "Dry run, nothing will be written");
        let factory = MemorySinkFactory::default();
        if stage.includes_foods() {
            let (source, normalizer) = open_foods(dir, &settings)?;
            let pipeline = Pipeline::new(settings.clone())
                .with_cancellation(cancel.clone())
                .with_progress(progress);
            outcome.foods = Some(pipeline.run(source, normalizer, &factory).await?);
        }
        if stage.includes_portions() && !outcome.foods_aborted() {
            if let Some((source, normalizer)) = open_portions(dir)? {
                let mut store: MemoryStore = factory.store().clone();
                let report = PortionStage::new(settings)
                    .with_cancellation(cancel)
                    .with_progress(progress)
                    .run(source, normalizer, &mut store)
                    .await?;
                outcome.portions = Some(report);
            }
        }
        return Ok(outcome);
    }

    let database = DatabaseSettings::from_env()?;
    if stage.includes_foods() {
        let (source, normalizer) = open_foods(dir, &settings)?;
        let pipeline = Pipeline::new(settings.clone())
            .with_cancellation(cancel.clone())
            .with_progress(progress);
        outcome.foods = Some(run_database(pipeline, source, normalizer).await?);
    }
    if stage.includes_portions() && !outcome.foods_aborted() {
        if let Some((source, normalizer)) = open_portions(dir)? {
            let mut store = PostgresPortionStore::connect(database.options())
                .await
                .with_context(|| format!("failed to connect to {}", database.target()))?;
            let report = PortionStage::new(settings)
                .with_cancellation(cancel)
                .with_progress(progress)
                .run(source, normalizer, &mut store)
                .await?;
            store.close().await?;
            outcome.portions = Some(report);
        }
    }
    Ok(outcome)
}

/// Load the catalog files and open `food_nutrient.csv` pivoted per food
fn open_foods(dir: &Path, settings: &PipelineSettings) -> anyhow::Result<(PivotRows<File>, Arc<dyn Normalizer>)> {
    let text = TextCleaner::new().context("failed to build text cleaner")?;
    let catalog = FdcCatalog::load(dir, &text)
        .with_context(|| format!("failed to load FoodData Central catalog from {}", dir.display()))?;
    if catalog.is_empty() {
        warn!(dir = %dir.display(), "food.csv lists no foods, every row will be skipped");
    }

    let normalizer: Arc<dyn Normalizer> =
        Arc::new(FdcNormalizer::new(Arc::new(catalog)).context("failed to build FoodData Central normalizer")?);
    let options = SourceOptions::csv()
        .chunk_size(settings.chunk_size)
        .max_rows(settings.max_rows);
    let source = fdc::open_nutrients(dir, options)
        .with_context(|| format!("failed to open {}", dir.join(fdc::FOOD_NUTRIENT_FILE).display()))?;
    Ok((source, normalizer))
}

/// `None` when the release carries no portion files
fn open_portions(dir: &Path) -> anyhow::Result<Option<(CsvSource<File>, Arc<PortionNormalizer>)>> {
    let portions = dir.join(fdc::FOOD_PORTION_FILE);
    let units = dir.join(fdc::MEASURE_UNIT_FILE);
    if !portions.is_file() || !units.is_file() {
        warn!(dir = %dir.display(), "No portion files in this release, skipping portions");
        return Ok(None);
    }

    let normalizer = Arc::new(PortionNormalizer::load(dir).context("failed to load measure units")?);
    let source = CsvSource::open(&portions, SourceOptions::csv())
        .with_context(|| format!("failed to open {}", portions.display()))?;
    Ok(Some((source, normalizer)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::{RunStatus, EXIT_ABORTED};
    use std::time::Duration;
    use uuid::Uuid;

    fn report(status: RunStatus) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            dataset: "fdc".into(),
            sink: "memory".into(),
            status,
            started_at: chrono::Utc::now(),
            elapsed: Duration::from_secs(1),
            totals: Default::default(),
        }
    }

    #[test]
    fn test_exit_code_is_worst_stage() {
        assert_eq!(FdcRun::default().exit_code(), EXIT_COMPLETED);

        let run = FdcRun {
            foods: Some(report(RunStatus::Completed)),
            portions: Some(report(RunStatus::Aborted {
                reason: "interrupted".into(),
            })),
        };
        assert_eq!(run.exit_code(), EXIT_ABORTED);
        assert!(!run.foods_aborted());
    }

    #[test]
    fn test_missing_portion_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(fdc::FOOD_PORTION_FILE), "fdc_id,gram_weight\n").unwrap();
        assert!(open_portions(dir.path()).unwrap().is_none());
    }
}
