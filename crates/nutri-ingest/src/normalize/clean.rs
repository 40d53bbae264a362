//! Cell cleaning shared by the dataset normalizers

use regex::{Captures, Regex};

/// Cell values that mean "no value" in the exported datasets
pub const SENTINELS: &[&str] = &["N/A", "NULL", "null", "None", "nan"];

/// Longest abbreviation stored for a measurement
pub const MAX_ABBREVIATION_LEN: usize = 8;

/// Trimmed text, or `None` when blank or a sentinel
pub fn clean_string(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || SENTINELS.contains(&trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Compiled patterns used while cleaning cells.
///
/// Built once per normalizer and shared by every row.
#[derive(Debug, Clone)]
pub struct TextCleaner {
    number: Regex,
    word: Regex,
    whitespace: Regex,
    leading_count: Regex,
    leading_quantity: Regex,
    household_unit: Regex,
    serving_grams: Regex,
}

impl TextCleaner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            number: Regex::new(r"[-+]?\d*\.?\d+(?:[eE][-+]?\d+)?")?,
            word: Regex::new(r"[a-z]+(?:'[a-z]+)?")?,
            whitespace: Regex::new(r"\s+")?,
            leading_count: Regex::new(r"^\d+\s*")?,
            leading_quantity: Regex::new(r"^\d+(?:\.\d+)?\s*")?,
            household_unit: Regex::new(r"\s*(piece|pieces|slice|slices|cup|cups|tablespoon|teaspoon)\s*")?,
            serving_grams: Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*g")?,
        })
    }

    /// First signed decimal or exponential number in `value`, or `0.0`.
    ///
    /// Thousands separators are dropped before matching, so `"1,234 kcal"`
    /// reads as `1234.0`. Never fails and never returns NaN or infinity.
    pub fn numeric(&self, value: Option<&str>) -> f64 {
        let Some(raw) = value.map(str::trim) else {
            return 0.0;
        };
        if raw.is_empty() || SENTINELS.contains(&raw) {
            return 0.0;
        }

        let without_separators = raw.replace(',', "");
        self.number
            .find(&without_separators)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .filter(|n| n.is_finite())
            .unwrap_or(0.0)
    }

    /// Title-cased name with collapsed whitespace, e.g. `"CHEDDAR  cheese"` -> `"Cheddar Cheese"`
    pub fn standardize_name(&self, value: Option<&str>) -> Option<String> {
        let cleaned = clean_string(value)?;
        let collapsed = self.whitespace.replace_all(&cleaned, " ").to_lowercase();
        let titled = self.word.replace_all(&collapsed, |caps: &Captures<'_>| capitalize(&caps[0]));
        Some(titled.into_owned())
    }

    /// Short code for a serving description: leading count dropped, first word, at most 8 chars
    pub fn abbreviation(&self, description: &str) -> String {
        let lowered = description.to_lowercase();
        let without_count = self.leading_count.replace(&lowered, "");
        let joined = self.household_unit.replace_all(&without_count, "$1");

        match joined.split_whitespace().next() {
            Some(word) => word.chars().take(MAX_ABBREVIATION_LEN).collect(),
            None => lowered.replace(' ', "").chars().take(MAX_ABBREVIATION_LEN).collect(),
        }
    }

    /// Serving description without its leading quantity, e.g. `"2 slices"` -> `"slices"`
    pub fn unit_label(&self, description: &str) -> String {
        let stripped = self.leading_quantity.replace(description, "");
        let stripped = stripped.trim();
        if stripped.is_empty() {
            description.trim().to_string()
        } else {
            stripped.to_string()
        }
    }

    /// Gram weight mentioned in a serving text such as `"1 bar (45 g)"`
    pub fn serving_grams(&self, value: &str) -> Option<f64> {
        self.serving_grams
            .captures(value)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .filter(|grams| *grams > 0.0)
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
