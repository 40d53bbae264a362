//! OpenFoodFacts product dump (tab-separated)
//!
//! Values are published per 100 g. Fatty acids and cholesterol are mixed
//! grams and milligrams and go through [`maybe_grams_to_mg`]; sodium is
//! derived from salt when missing; energy is read in kcal or converted
//! from kJ.

use super::clean::{clean_string, TextCleaner};
use super::units::{calories, maybe_grams_to_mg, sodium_mg};
use super::{Normalized, Normalizer, SkipReason};
use crate::record::{Measurement, NormalizedRecord, Nutrients};
use crate::source::{RawRecord, SourceOptions};

const REQUIRED_COLUMNS: &[&str] = &["code", "product_name"];

/// Normalizer for the OpenFoodFacts CSV/TSV export
#[derive(Debug, Clone)]
pub struct OpenFoodFactsNormalizer {
    text: TextCleaner,
}

impl OpenFoodFactsNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            text: TextCleaner::new()?,
        })
    }

    fn nutrients(&self, raw: &RawRecord) -> Nutrients {
        let num = |column: &str| self.text.numeric(raw.get(column));
        let mg = |column: &str| maybe_grams_to_mg(num(column));
        let folate = match num("folates_100g") {
            f if f != 0.0 => f,
            _ => num("vitamin-b9_100g"),
        };

        Nutrients {
            protein: num("proteins_100g"),
            carbs: num("carbohydrates_100g"),
            fat: num("fat_100g"),
            fiber: num("fiber_100g"),
            sugar: num("sugars_100g"),
            sodium: sodium_mg(num("sodium_100g"), num("salt_100g")),
            saturated_fat: num("saturated-fat_100g"),
            trans_fat: num("trans-fat_100g"),
            cholesterol: mg("cholesterol_100g"),
            added_sugar: num("added-sugars_100g"),
            soluble_fiber: num("soluble-fiber_100g"),
            insoluble_fiber: num("insoluble-fiber_100g"),
            water: num("water_100g"),
            omega3: mg("omega-3-fat_100g"),
            omega6: mg("omega-6-fat_100g"),
            mono_fat: mg("monounsaturated-fat_100g"),
            poly_fat: mg("polyunsaturated-fat_100g"),
            ala: mg("alpha-linolenic-acid_100g"),
            epa: mg("eicosapentaenoic-acid_100g"),
            dha: mg("docosahexaenoic-acid_100g"),
            calcium: num("calcium_100g"),
            iron: num("iron_100g"),
            potassium: num("potassium_100g"),
            magnesium: num("magnesium_100g"),
            vitamin_a_rae: num("vitamin-a_100g"),
            vitamin_c: num("vitamin-c_100g"),
            vitamin_b12: num("vitamin-b12_100g"),
            vitamin_d: num("vitamin-d_100g"),
            vitamin_e: num("vitamin-e_100g"),
            phosphorus: num("phosphorus_100g"),
            zinc: num("zinc_100g"),
            copper: num("copper_100g"),
            manganese: num("manganese_100g"),
            selenium: num("selenium_100g"),
            fluoride: num("fluoride_100g"),
            molybdenum: num("molybdenum_100g"),
            chlorine: num("chloride_100g"),
            vitamin_b1: num("vitamin-b1_100g"),
            vitamin_b2: num("vitamin-b2_100g"),
            vitamin_b3: num("vitamin-pp_100g"),
            vitamin_b6: num("vitamin-b6_100g"),
            biotin: num("biotin_100g"),
            folate,
            vitamin_k: num("vitamin-k_100g"),
            choline: num("choline_100g"),
            betaine: num("betaine_100g"),
            carotene_beta: num("beta-carotene_100g"),
            lycopene: num("lycopene_100g"),
            lutein_zeaxanthin: num("lutein-zeaxanthin_100g"),
            ..Nutrients::default()
        }
    }

    /// Serving parsed from `serving_size` ("1 bar (45 g)"), or from
    /// `serving_quantity` when its unit is grams.
    fn serving(&self, raw: &RawRecord) -> Option<Measurement> {
        let mut label = clean_string(raw.get("serving_size"));
        let mut grams = label.as_deref().and_then(|text| self.text.serving_grams(text));

        if grams.is_none() {
            let quantity = self.text.numeric(raw.get("serving_quantity"));
            let in_grams = clean_string(raw.get("serving_quantity_unit"))
                .is_some_and(|unit| unit.to_lowercase().starts_with('g'));
            if quantity > 0.0 && in_grams {
                grams = Some(quantity);
                label.get_or_insert_with(|| format!("{quantity} g"));
            }
        }

        let (label, grams) = (label?, grams?);
        Some(Measurement {
            abbreviation: self.text.abbreviation(&label),
            unit: self.text.unit_label(&label),
            name: label,
            weight_in_grams: grams,
            is_default: false,
            is_from_source: true,
        })
    }
}

impl Normalizer for OpenFoodFactsNormalizer {
    fn dataset(&self) -> &'static str {
        "openfoodfacts"
    }

    fn required_columns(&self) -> &'static [&'static str] {
        REQUIRED_COLUMNS
    }

    fn source_options(&self) -> SourceOptions {
        SourceOptions::tsv()
    }

    fn normalize(&self, raw: &RawRecord) -> Normalized {
        let Some(barcode) = clean_string(raw.get("code")) else {
            return Normalized::Skip(SkipReason::MissingSourceId);
        };
        let name = self
            .text
            .standardize_name(raw.get("product_name"))
            .or_else(|| self.text.standardize_name(raw.get("generic_name")));
        let Some(name) = name else {
            return Normalized::Skip(SkipReason::MissingName);
        };

        let kcal = self.text.numeric(raw.get("energy-kcal_100g"));
        let kj = match self.text.numeric(raw.get("energy-kj_100g")) {
            kj if kj != 0.0 => kj,
            _ => self.text.numeric(raw.get("energy_100g")),
        };

        let mut record = NormalizedRecord::new(barcode.clone(), name, calories(kcal, kj));
        record.barcode = Some(barcode);
        record.brand = clean_string(raw.get("brands"));
        record.food_group = clean_string(raw.get("categories_en"));
        record.nutrients = self.nutrients(raw);
        record.measurements.extend(self.serving(raw));

        Normalized::Record(Box::new(record))
    }
}
