//! FoodData Central CSV release
//!
//! A release is a directory of CSV files. Nutrient amounts arrive in long
//! form in `food_nutrient.csv`, one row per `(fdc_id, nutrient_id)`, and are
//! pivoted into one record per food before normalization (see
//! [`CsvSource::pivot`]). Names, brands, barcodes and serving sizes live in
//! side files that are loaded up front into an [`FdcCatalog`].
//!
//! Household portions (`food_portion.csv`) are a separate stage that only
//! adds measurements to foods already imported; [`PortionNormalizer`] maps
//! those rows.

use super::clean::{clean_string, TextCleaner};
use super::units::calories;
use super::{Normalized, Normalizer, SkipReason};
use crate::error::SourceError;
use crate::record::{Measurement, NormalizedRecord, Nutrients};
use crate::source::{CsvSource, PivotRows, RawRecord, SourceOptions};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const FOOD_FILE: &str = "food.csv";
pub const NUTRIENT_FILE: &str = "nutrient.csv";
pub const FOOD_NUTRIENT_FILE: &str = "food_nutrient.csv";
pub const BRANDED_FOOD_FILE: &str = "branded_food.csv";
pub const FOOD_PORTION_FILE: &str = "food_portion.csv";
pub const MEASURE_UNIT_FILE: &str = "measure_unit.csv";

/// Columns of `food_nutrient.csv` the pivot reads
pub const FDC_ID: &str = "fdc_id";
pub const NUTRIENT_ID: &str = "nutrient_id";
pub const AMOUNT: &str = "amount";

const REQUIRED_COLUMNS: &[&str] = &[FDC_ID, NUTRIENT_ID, AMOUNT];
const PORTION_REQUIRED_COLUMNS: &[&str] = &[FDC_ID, "gram_weight"];

/// Unit label used when a portion's measure unit is unknown
pub const FALLBACK_UNIT: &str = "unit";

/// International units per microgram of vitamin D
pub const VITAMIN_D_IU_PER_UG: f64 = 40.0;

/// Nutrient amounts that are published in grams but stored in milligrams
const MG_PER_G: f64 = 1000.0;

/// Which `nutrient.csv` names feed each field, and the unit required, if any.
///
/// Several names may map to one field; the first id present in a food wins.
const NUTRIENT_NAMES: &[(&str, &[&str], Option<&str>)] = &[
    ("calories", &["Energy", "Energy (Atwater General Factors)"], Some("KCAL")),
    ("energy_kj", &["Energy"], Some("kJ")),
    ("protein", &["Protein"], None),
    ("fat", &["Total lipid (fat)"], None),
    ("carbs", &["Carbohydrate, by difference"], None),
    ("fiber", &["Fiber, total dietary"], None),
    ("sugar", &["Total Sugars", "Sugars, Total"], None),
    ("added_sugar", &["Sugars, added"], None),
    ("sodium", &["Sodium, Na"], None),
    ("saturated_fat", &["Fatty acids, total saturated"], None),
    ("trans_fat", &["Fatty acids, total trans"], None),
    (
        "trans_fat_alt",
        &[
            "Fatty acids, total trans-monoenoic",
            "Fatty acids, total trans-dienoic",
            "Fatty acids, total trans-polyenoic",
        ],
        None,
    ),
    ("cholesterol", &["Cholesterol"], None),
    ("soluble_fiber", &["Fiber, soluble"], None),
    ("insoluble_fiber", &["Fiber, insoluble"], None),
    ("water", &["Water"], None),
    ("mono_fat", &["Fatty acids, total monounsaturated"], None),
    ("poly_fat", &["Fatty acids, total polyunsaturated"], None),
    ("calcium", &["Calcium, Ca"], None),
    ("iron", &["Iron, Fe"], None),
    ("potassium", &["Potassium, K"], None),
    ("magnesium", &["Magnesium, Mg"], None),
    ("vitamin_a_iu", &["Vitamin A, IU"], None),
    ("vitamin_a_rae", &["Vitamin A, RAE"], None),
    ("vitamin_c", &["Vitamin C, total ascorbic acid"], None),
    ("vitamin_b12", &["Vitamin B-12"], None),
    ("vitamin_d", &["Vitamin D (D2 + D3)"], None),
    ("vitamin_d2", &["Vitamin D2 (ergocalciferol)"], None),
    ("vitamin_d3", &["Vitamin D3 (cholecalciferol)"], None),
    ("vitamin_e", &["Vitamin E (alpha-tocopherol)"], None),
    ("phosphorus", &["Phosphorus, P"], None),
    ("zinc", &["Zinc, Zn"], None),
    ("copper", &["Copper, Cu"], None),
    ("manganese", &["Manganese, Mn"], None),
    ("selenium", &["Selenium, Se"], None),
    ("fluoride", &["Fluoride, F"], None),
    ("molybdenum", &["Molybdenum, Mo"], None),
    ("vitamin_b1", &["Thiamin"], None),
    ("vitamin_b2", &["Riboflavin"], None),
    ("vitamin_b3", &["Niacin"], None),
    ("vitamin_b5", &["Pantothenic acid"], None),
    ("vitamin_b6", &["Vitamin B-6"], None),
    ("biotin", &["Biotin"], None),
    ("folate", &["Folate, total"], None),
    ("folic_acid", &["Folic acid"], None),
    ("food_folate", &["Folate, food"], None),
    ("folate_dfe", &["Folate, DFE"], None),
    ("choline", &["Choline, total"], None),
    ("betaine", &["Betaine"], None),
    ("retinol", &["Retinol"], None),
    ("carotene_beta", &["Carotene, beta"], None),
    ("carotene_alpha", &["Carotene, alpha"], None),
    ("lycopene", &["Lycopene"], None),
    ("lutein_zeaxanthin", &["Lutein + zeaxanthin"], None),
    ("vitamin_k", &["Vitamin K (phylloquinone)"], None),
];

/// Nutrient ids of the release, grouped by the field they feed
#[derive(Debug, Clone, Default)]
pub struct NutrientIds {
    by_field: HashMap<&'static str, Vec<String>>,
}

impl NutrientIds {
    /// Resolve every field from `(id, name, unit)` rows of `nutrient.csv`
    pub fn from_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str, &'a str)>,
    {
        let mut by_name: HashMap<&str, Vec<(&str, &str)>> = HashMap::new();
        for (id, name, unit) in rows {
            by_name.entry(name).or_default().push((id, unit));
        }

        let by_field = NUTRIENT_NAMES
            .iter()
            .map(|(field, names, unit_filter)| {
                let ids = names
                    .iter()
                    .flat_map(|name| by_name.get(name).into_iter().flatten())
                    .filter(|(_, unit)| unit_filter.is_none_or(|wanted| unit.eq_ignore_ascii_case(wanted)))
                    .map(|(id, _)| id.to_string())
                    .collect();
                (*field, ids)
            })
            .collect();
        Self { by_field }
    }

    pub fn ids(&self, field: &str) -> &[String] {
        self.by_field.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    /// Fields with no id in this release
    pub fn unresolved(&self) -> Vec<&'static str> {
        let mut fields: Vec<&'static str> = NUTRIENT_NAMES
            .iter()
            .map(|(field, _, _)| *field)
            .filter(|field| self.ids(field).is_empty())
            .collect();
        fields.sort_unstable();
        fields
    }
}

/// Brand details of a branded food
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrandedFood {
    pub brand_owner: Option<String>,
    pub brand_name: Option<String>,
    pub gtin_upc: Option<String>,
    pub serving_size: f64,
    pub serving_size_unit: Option<String>,
    pub household_serving: Option<String>,
}

/// Side tables of a release, keyed by `fdc_id`
#[derive(Debug, Clone, Default)]
pub struct FdcCatalog {
    nutrient_ids: NutrientIds,
    descriptions: HashMap<String, String>,
    branded: HashMap<String, BrandedFood>,
}

impl FdcCatalog {
    /// Read `nutrient.csv`, `food.csv` and, when present, `branded_food.csv` from `dir`
    pub fn load(dir: &Path, text: &TextCleaner) -> Result<Self, SourceError> {
        let mut nutrients = Vec::new();
        for_each_row(&dir.join(NUTRIENT_FILE), &["id", "name", "unit_name"], |raw| {
            if let (Some(id), Some(name), Some(unit)) = (
                clean_string(raw.get("id")),
                clean_string(raw.get("name")),
                clean_string(raw.get("unit_name")),
            ) {
                nutrients.push((id, name, unit));
            }
        })?;
        let nutrient_ids =
            NutrientIds::from_rows(nutrients.iter().map(|(id, name, unit)| (id.as_str(), name.as_str(), unit.as_str())));

        let mut descriptions = HashMap::new();
        for_each_row(&dir.join(FOOD_FILE), &[FDC_ID, "description"], |raw| {
            if let (Some(fdc_id), Some(description)) = (clean_string(raw.get(FDC_ID)), clean_string(raw.get("description")))
            {
                descriptions.insert(fdc_id, description);
            }
        })?;

        let mut branded = HashMap::new();
        let branded_path = dir.join(BRANDED_FOOD_FILE);
        if branded_path.exists() {
            for_each_row(&branded_path, &[FDC_ID], |raw| {
                let Some(fdc_id) = clean_string(raw.get(FDC_ID)) else {
                    return;
                };
                branded.insert(
                    fdc_id,
                    BrandedFood {
                        brand_owner: clean_string(raw.get("brand_owner")),
                        brand_name: clean_string(raw.get("brand_name")),
                        gtin_upc: clean_string(raw.get("gtin_upc")),
                        serving_size: text.numeric(raw.get("serving_size")),
                        serving_size_unit: clean_string(raw.get("serving_size_unit")),
                        household_serving: clean_string(raw.get("household_serving_fulltext")),
                    },
                );
            })?;
        }

        let catalog = Self {
            nutrient_ids,
            descriptions,
            branded,
        };
        let unresolved = catalog.nutrient_ids.unresolved();
        if !unresolved.is_empty() {
            warn!(fields = ?unresolved, "Nutrients not found in release, they will be zero");
        }
        info!(
            foods = catalog.descriptions.len(),
            branded = catalog.branded.len(),
            "FoodData Central catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_parts(
        nutrient_ids: NutrientIds,
        descriptions: HashMap<String, String>,
        branded: HashMap<String, BrandedFood>,
    ) -> Self {
        Self {
            nutrient_ids,
            descriptions,
            branded,
        }
    }

    pub fn nutrient_ids(&self) -> &NutrientIds {
        &self.nutrient_ids
    }

    pub fn description(&self, fdc_id: &str) -> Option<&str> {
        self.descriptions.get(fdc_id).map(String::as_str)
    }

    pub fn branded(&self, fdc_id: &str) -> Option<&BrandedFood> {
        self.branded.get(fdc_id)
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }
}

/// Call `f` with every readable row of a side file; unreadable rows are dropped
fn for_each_row(path: &Path, required: &[&str], mut f: impl FnMut(&RawRecord)) -> Result<(), SourceError> {
    let source = CsvSource::open(path, SourceOptions::csv())?;
    source.require(required)?;

    for item in source {
        match item {
            Ok(raw) => f(&raw),
            Err(e) if e.is_row_level() => warn!(path = %path.display(), error = %e, "Skipping unreadable row"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Open `food_nutrient.csv` of the release in `dir`, pivoted per food
pub fn open_nutrients(dir: &Path, options: SourceOptions) -> Result<PivotRows<File>, SourceError> {
    Ok(CsvSource::open(dir.join(FOOD_NUTRIENT_FILE), options)?.pivot(FDC_ID, NUTRIENT_ID, AMOUNT))
}

/// Amount formatted without a trailing `.0` when it is whole
fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Normalizer for pivoted `food_nutrient.csv` records
#[derive(Debug, Clone)]
pub struct FdcNormalizer {
    text: TextCleaner,
    catalog: Arc<FdcCatalog>,
}

impl FdcNormalizer {
    pub fn new(catalog: Arc<FdcCatalog>) -> Result<Self, regex::Error> {
        Ok(Self {
            text: TextCleaner::new()?,
            catalog,
        })
    }

    /// Amount of the first id of `field` present in the record, or 0
    fn first_amount(&self, raw: &RawRecord, field: &str) -> f64 {
        self.catalog
            .nutrient_ids
            .ids(field)
            .iter()
            .find_map(|id| raw.get(id))
            .map_or(0.0, |value| self.text.numeric(Some(value)))
    }

    fn calories(&self, raw: &RawRecord) -> i32 {
        let kcal = self.first_amount(raw, "calories");
        let kj = self
            .catalog
            .nutrient_ids
            .ids("energy_kj")
            .first()
            .and_then(|id| raw.get(id))
            .map_or(0.0, |value| self.text.numeric(Some(value)));
        calories(kcal, kj)
    }

    fn nutrients(&self, raw: &RawRecord) -> Nutrients {
        let num = |field: &str| self.first_amount(raw, field);

        let trans_fat = match num("trans_fat") {
            t if t > 0.0 => t,
            _ => self
                .catalog
                .nutrient_ids
                .ids("trans_fat_alt")
                .iter()
                .filter_map(|id| raw.get(id))
                .map(|value| self.text.numeric(Some(value)))
                .sum(),
        };
        let vitamin_d = num("vitamin_d");

        Nutrients {
            protein: num("protein"),
            carbs: num("carbs"),
            fat: num("fat"),
            fiber: num("fiber"),
            sugar: num("sugar"),
            sodium: num("sodium"),
            saturated_fat: num("saturated_fat"),
            trans_fat,
            cholesterol: num("cholesterol"),
            added_sugar: num("added_sugar"),
            soluble_fiber: num("soluble_fiber"),
            insoluble_fiber: num("insoluble_fiber"),
            water: num("water"),
            mono_fat: num("mono_fat") * MG_PER_G,
            poly_fat: num("poly_fat") * MG_PER_G,
            calcium: num("calcium"),
            iron: num("iron"),
            potassium: num("potassium"),
            magnesium: num("magnesium"),
            vitamin_a_iu: num("vitamin_a_iu"),
            vitamin_a_rae: num("vitamin_a_rae"),
            vitamin_c: num("vitamin_c"),
            vitamin_b12: num("vitamin_b12"),
            vitamin_d,
            vitamin_d2: num("vitamin_d2"),
            vitamin_d3: num("vitamin_d3"),
            vitamin_d_iu: if vitamin_d > 0.0 { vitamin_d * VITAMIN_D_IU_PER_UG } else { 0.0 },
            vitamin_e: num("vitamin_e"),
            phosphorus: num("phosphorus"),
            zinc: num("zinc"),
            copper: num("copper"),
            manganese: num("manganese"),
            selenium: num("selenium"),
            fluoride: num("fluoride"),
            molybdenum: num("molybdenum"),
            vitamin_b1: num("vitamin_b1"),
            vitamin_b2: num("vitamin_b2"),
            vitamin_b3: num("vitamin_b3"),
            vitamin_b5: num("vitamin_b5"),
            vitamin_b6: num("vitamin_b6"),
            biotin: num("biotin"),
            folate: num("folate"),
            folic_acid: num("folic_acid"),
            food_folate: num("food_folate"),
            folate_dfe: num("folate_dfe"),
            choline: num("choline"),
            betaine: num("betaine"),
            retinol: num("retinol"),
            carotene_beta: num("carotene_beta"),
            carotene_alpha: num("carotene_alpha"),
            lycopene: num("lycopene"),
            lutein_zeaxanthin: num("lutein_zeaxanthin"),
            vitamin_k: num("vitamin_k"),
            ..Nutrients::default()
        }
    }

    /// Label serving of a branded food, when it is given in grams
    fn serving(&self, branded: &BrandedFood) -> Option<Measurement> {
        let unit = branded.serving_size_unit.as_deref()?;
        if branded.serving_size <= 0.0 || !unit.to_lowercase().starts_with('g') {
            return None;
        }
        let name = branded
            .household_serving
            .clone()
            .unwrap_or_else(|| format!("{} {unit}", format_amount(branded.serving_size)));
        Some(Measurement {
            abbreviation: self.text.abbreviation(&name),
            name,
            unit: unit.to_string(),
            weight_in_grams: branded.serving_size,
            is_default: false,
            is_from_source: true,
        })
    }
}

impl Normalizer for FdcNormalizer {
    fn dataset(&self) -> &'static str {
        "fdc"
    }

    fn required_columns(&self) -> &'static [&'static str] {
        REQUIRED_COLUMNS
    }

    fn source_options(&self) -> SourceOptions {
        SourceOptions::csv()
    }

    fn normalize(&self, raw: &RawRecord) -> Normalized {
        let Some(fdc_id) = clean_string(raw.get(FDC_ID)) else {
            return Normalized::Skip(SkipReason::MissingSourceId);
        };
        let Some(description) = self.catalog.description(&fdc_id) else {
            return Normalized::Skip(SkipReason::NotInCatalog);
        };
        let Some(name) = self.text.standardize_name(Some(description)) else {
            return Normalized::Skip(SkipReason::MissingName);
        };

        let mut record = NormalizedRecord::new(fdc_id.clone(), name, self.calories(raw));
        record.is_csv_food = true;
        record.nutrients = self.nutrients(raw);

        if let Some(branded) = self.catalog.branded(&fdc_id) {
            record.brand = branded.brand_owner.clone().or_else(|| branded.brand_name.clone());
            record.barcode = branded.gtin_upc.clone();
            record.measurements.extend(self.serving(branded));
        }

        Normalized::Record(Box::new(record))
    }
}

/// One household portion of an imported food
#[derive(Debug, Clone, PartialEq)]
pub struct FdcPortion {
    pub fdc_id: String,
    pub measurement: Measurement,
}

/// Maps `food_portion.csv` rows onto measurements
#[derive(Debug, Clone)]
pub struct PortionNormalizer {
    text: TextCleaner,
    units: HashMap<String, String>,
}

impl PortionNormalizer {
    /// `units` maps `measure_unit_id` to the unit's name
    pub fn new(units: HashMap<String, String>) -> Result<Self, regex::Error> {
        Ok(Self {
            text: TextCleaner::new()?,
            units,
        })
    }

    /// Build from `measure_unit.csv` in `dir`
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let mut units = HashMap::new();
        for_each_row(&dir.join(MEASURE_UNIT_FILE), &["id", "name"], |raw| {
            if let (Some(id), Some(name)) = (clean_string(raw.get("id")), clean_string(raw.get("name"))) {
                units.insert(id, name);
            }
        })?;
        Ok(Self::new(units)?)
    }

    pub fn required_columns(&self) -> &'static [&'static str] {
        PORTION_REQUIRED_COLUMNS
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<FdcPortion, SkipReason> {
        let fdc_id = clean_string(raw.get(FDC_ID)).ok_or(SkipReason::MissingSourceId)?;
        let gram_weight = self.text.numeric(raw.get("gram_weight"));
        if gram_weight <= 0.0 {
            return Err(SkipReason::InvalidPortion);
        }

        let unit = clean_string(raw.get("measure_unit_id"))
            .and_then(|id| self.units.get(&id).cloned())
            .unwrap_or_else(|| FALLBACK_UNIT.to_string());

        let name = match clean_string(raw.get("portion_description")) {
            Some(description) => description,
            None => {
                let amount = self.text.numeric(raw.get("amount"));
                let parts = [
                    (amount != 0.0).then(|| format_amount(amount)),
                    clean_string(raw.get("modifier")),
                    Some(unit.clone()),
                ];
                parts.into_iter().flatten().collect::<Vec<_>>().join(" ")
            },
        };

        Ok(FdcPortion {
            fdc_id,
            measurement: Measurement {
                abbreviation: self.text.abbreviation(&name),
                name,
                unit,
                weight_in_grams: gram_weight,
                is_default: false,
                is_from_source: true,
            },
        })
    }
}
