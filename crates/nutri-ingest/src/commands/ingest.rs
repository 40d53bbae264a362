//! `myfooddata` and `openfoodfacts` commands

use crate::config::{ApiSettings, DatabaseSettings, PipelineSettings};
use crate::normalize::{MyFoodDataNormalizer, Normalizer, OpenFoodFactsNormalizer};
use crate::pipeline::{open_source, Pipeline, RunReport};
use crate::sink::http::HttpSinkFactory;
use crate::sink::memory::MemorySinkFactory;
use crate::sink::postgres::{self, PostgresSinkFactory};
use crate::source::RecordSource;
use crate::{PipelineArgs, SinkKind};
use anyhow::Context;
use sqlx::{Connection, PgConnection};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Destination picked on the command line
#[derive(Debug, Clone)]
pub enum Target {
    Database,
    Http { api_url: Option<String>, token: Option<String> },
    DryRun,
}

impl Target {
    pub fn from_flags(sink: SinkKind, api_url: Option<String>, token: Option<String>, dry_run: bool) -> Self {
        match (dry_run, sink) {
            (true, _) => Target::DryRun,
            (false, SinkKind::Database) => Target::Database,
            (false, SinkKind::Http) => Target::Http { api_url, token },
        }
    }
}

pub async fn myfooddata(
    file: &Path,
    skip_rows: Option<usize>,
    target: Target,
    args: &PipelineArgs,
    cancel: CancellationToken,
) -> anyhow::Result<RunReport> {
    let normalizer: Arc<dyn Normalizer> =
        Arc::new(MyFoodDataNormalizer::new().context("failed to build MyFoodData normalizer")?);
    run(file, skip_rows, normalizer, target, args, cancel).await
}

pub async fn openfoodfacts(
    file: &Path,
    target: Target,
    args: &PipelineArgs,
    cancel: CancellationToken,
) -> anyhow::Result<RunReport> {
    let normalizer: Arc<dyn Normalizer> =
        Arc::new(OpenFoodFactsNormalizer::new().context("failed to build OpenFoodFacts normalizer")?);
    run(file, None, normalizer, target, args, cancel).await
}

async fn run(
    file: &Path,
    skip_rows: Option<usize>,
    normalizer: Arc<dyn Normalizer>,
    target: Target,
    args: &PipelineArgs,
    cancel: CancellationToken,
) -> anyhow::Result<RunReport> {
    let settings = args.apply(PipelineSettings::from_env()?)?;
    let source = open_source(file, normalizer.as_ref(), &settings, skip_rows)
        .with_context(|| format!("failed to open {}", file.display()))?;

    let pipeline = Pipeline::new(settings)
        .with_cancellation(cancel)
        .with_progress(std::io::stderr().is_terminal());

    match target {
        Target::DryRun => {
            info!(file = %file.display(), "Dry run, nothing will be written");
            pipeline.run(source, normalizer, &MemorySinkFactory::default()).await
        },
        Target::Http { api_url, token } => {
            let mut api = ApiSettings::from_env()?;
            if let Some(url) = api_url {
                api.base_url = url;
            }
            if token.is_some() {
                api.token = token;
            }
            let factory = HttpSinkFactory::new(&api.base_url, &api.bulk_path, api.token.clone(), api.timeout());
            info!(endpoint = factory.endpoint(), "Writing to food API");
            pipeline.run(source, normalizer, &factory).await
        },
        Target::Database => run_database(pipeline, source, normalizer).await,
    }
}

/// Check the schema, warm the match cache, then run into the database
pub(crate) async fn run_database<S: RecordSource>(
    pipeline: Pipeline,
    source: S,
    normalizer: Arc<dyn Normalizer>,
) -> anyhow::Result<RunReport> {
    let database = DatabaseSettings::from_env()?;
    let mut conn = PgConnection::connect_with(database.options())
        .await
        .with_context(|| format!("failed to connect to {}", database.target()))?;

    postgres::verify_schema(&mut conn).await?;
    postgres::warm_match_cache(&mut conn, pipeline.match_cache())
        .await
        .context("failed to load existing foods")?;
    conn.close().await?;

    pipeline
        .run(source, normalizer, &PostgresSinkFactory::new(database.options().clone()))
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_wins_over_sink() {
        assert!(matches!(
            Target::from_flags(SinkKind::Database, None, None, true),
            Target::DryRun
        ));
        assert!(matches!(
            Target::from_flags(SinkKind::Http, Some("http://api".into()), None, false),
            Target::Http { api_url: Some(_), .. }
        ));
    }
}
