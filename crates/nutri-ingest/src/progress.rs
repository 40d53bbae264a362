//! Terminal progress for ingestion runs
//!
//! A spinner counting scanned rows, with the batch outcome totals as its
//! message. Hidden when stderr is not a terminal; the heartbeat log lines
//! carry the same numbers.

use crate::accounting::AccountingSnapshot;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {prefix} {pos} rows ({per_sec}) {msg}";

#[derive(Debug, Clone)]
pub struct RunProgress {
    bar: ProgressBar,
}

impl RunProgress {
    pub fn new(dataset: &str, visible: bool) -> Self {
        if !visible {
            return Self::hidden();
        }

        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_prefix(dataset.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn row(&self) {
        self.bar.inc(1);
    }

    pub fn rows(&self) -> u64 {
        self.bar.position()
    }

    pub fn update(&self, snapshot: &AccountingSnapshot) {
        self.bar.set_message(format_counts(snapshot));
    }

    pub fn finish(&self, snapshot: &AccountingSnapshot) {
        self.bar.finish_with_message(format_counts(snapshot));
    }
}

/// Short outcome summary, e.g. `"1200 ok, 100 failed, 3 skipped"`
pub fn format_counts(snapshot: &AccountingSnapshot) -> String {
    format!(
        "{} ok, {} failed, {} skipped",
        snapshot.rows_succeeded, snapshot.rows_failed, snapshot.rows_skipped
    )
}
