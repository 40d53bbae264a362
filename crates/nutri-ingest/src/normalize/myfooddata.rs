//! MyFoodData CSV export

use super::clean::{clean_string, TextCleaner};
use super::units::round_to_i32;
use super::{Normalized, Normalizer, SkipReason};
use crate::record::{Measurement, NormalizedRecord, Nutrients};
use crate::source::{RawRecord, SourceOptions};

/// Title and notice lines above the header row
pub const PREAMBLE_ROWS: usize = 3;

/// The export carries up to nine household servings per food
pub const SERVING_SLOTS: usize = 9;

const REQUIRED_COLUMNS: &[&str] = &["Name"];

/// Normalizer for the MyFoodData nutrition facts spreadsheet
#[derive(Debug, Clone)]
pub struct MyFoodDataNormalizer {
    text: TextCleaner,
}

impl MyFoodDataNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            text: TextCleaner::new()?,
        })
    }

    fn nutrients(&self, raw: &RawRecord) -> Nutrients {
        let num = |column: &str| self.text.numeric(raw.get(column));

        Nutrients {
            protein: num("Protein (g)"),
            carbs: num("Carbohydrate (g)"),
            fat: num("Fat (g)"),
            fiber: num("Fiber (g)"),
            sugar: num("Sugars (g)"),
            sodium: num("Sodium (mg)"),
            saturated_fat: num("Saturated Fats (g)"),
            trans_fat: num("Trans Fatty Acids (g)"),
            cholesterol: num("Cholesterol (mg)"),
            added_sugar: num("Added Sugar (g)"),
            net_carbs: num("Net-Carbs (g)"),
            soluble_fiber: num("Soluble Fiber (g)"),
            insoluble_fiber: num("Insoluble Fiber (g)"),
            water: num("Water (g)"),
            pral_score: num("PRAL score"),
            omega3: num("Omega 3s (mg)"),
            omega6: num("Omega 6s (mg)"),
            mono_fat: num("Fatty acids, total monounsaturated (mg)"),
            poly_fat: num("Fatty acids, total polyunsaturated (mg)"),
            ala: num("18:3 n-3 c,c,c (ALA) (mg)"),
            epa: num("20:5 n-3 (EPA) (mg)"),
            dpa: num("22:5 n-3 (DPA) (mg)"),
            dha: num("22:6 n-3 (DHA) (mg)"),
            calcium: num("Calcium (mg)"),
            iron: num("Iron, Fe (mg)"),
            potassium: num("Potassium, K (mg)"),
            magnesium: num("Magnesium (mg)"),
            vitamin_a_iu: num("Vitamin A, IU (IU)"),
            vitamin_a_rae: num("Vitamin A, RAE (mcg)"),
            vitamin_c: num("Vitamin C (mg)"),
            vitamin_b12: num("Vitamin B-12 (mcg)"),
            vitamin_d: num("Vitamin D (mcg)"),
            vitamin_d2: num("Vitamin D2 (ergocalciferol) (mcg)"),
            vitamin_d3: num("Vitamin D3 (cholecalciferol) (mcg)"),
            vitamin_d_iu: num("Vitamin D (IU) (IU)"),
            vitamin_e: num("Vitamin E (Alpha-Tocopherol) (mg)"),
            phosphorus: num("Phosphorus, P (mg)"),
            zinc: num("Zinc, Zn (mg)"),
            copper: num("Copper, Cu (mg)"),
            manganese: num("Manganese (mg)"),
            selenium: num("Selenium, Se (mcg)"),
            fluoride: num("Fluoride, F (mcg)"),
            molybdenum: num("Molybdenum (mcg)"),
            chlorine: num("Chlorine (mg)"),
            vitamin_b1: num("Thiamin (B1) (mg)"),
            vitamin_b2: num("Riboflavin (B2) (mg)"),
            vitamin_b3: num("Niacin (B3) (mg)"),
            vitamin_b5: num("Pantothenic acid (B5) (mg)"),
            vitamin_b6: num("Vitamin B6 (mg)"),
            biotin: num("Biotin (B7) (mcg)"),
            folate: num("Folate (B9) (mcg)"),
            folic_acid: num("Folic acid (mcg)"),
            food_folate: num("Food Folate (mcg)"),
            folate_dfe: num("Folate DFE (mcg)"),
            vitamin_k: num("Vitamin K (mcg)"),
            dihydrophylloquinone: num("Dihydrophylloquinone (mcg)"),
            menaquinone4: num("Menaquinone-4 (mcg)"),
            choline: num("Choline (mg)"),
            betaine: num("Betaine (mg)"),
            retinol: num("Retinol (mcg)"),
            carotene_beta: num("Carotene, beta (mcg)"),
            carotene_alpha: num("Carotene, alpha (mcg)"),
            lycopene: num("Lycopene (mcg)"),
            lutein_zeaxanthin: num("Lutein + Zeaxanthin (mcg)"),
        }
    }

    /// Default measurements plus every filled "Serving Weight N" / "Serving Description N" pair
    fn measurements(&self, raw: &RawRecord) -> Vec<Measurement> {
        let mut measurements = Measurement::defaults();

        for slot in 1..=SERVING_SLOTS {
            let weight = self.text.numeric(raw.get(&format!("Serving Weight {slot} (g)")));
            let Some(description) = clean_string(raw.get(&format!("Serving Description {slot} (g)"))) else {
                continue;
            };
            if weight <= 0.0 {
                continue;
            }

            measurements.push(Measurement {
                abbreviation: self.text.abbreviation(&description),
                unit: self.text.unit_label(&description),
                name: description,
                weight_in_grams: weight,
                is_default: false,
                is_from_source: true,
            });
        }

        measurements
    }
}

impl Normalizer for MyFoodDataNormalizer {
    fn dataset(&self) -> &'static str {
        "myfooddata"
    }

    fn required_columns(&self) -> &'static [&'static str] {
        REQUIRED_COLUMNS
    }

    fn source_options(&self) -> SourceOptions {
        SourceOptions::csv().skip_rows(PREAMBLE_ROWS)
    }

    fn normalize(&self, raw: &RawRecord) -> Normalized {
        let Some(name) = clean_string(raw.get("Name")) else {
            return Normalized::Skip(SkipReason::MissingName);
        };
        let calories = round_to_i32(self.text.numeric(raw.get("Calories")));

        // Rows without an ID fall back to the natural key so reruns upsert the same food
        let mut record = NormalizedRecord::new(String::new(), name, calories);
        record.source_id = clean_string(raw.get("ID"))
            .unwrap_or_else(|| format!("myfooddata:{}", record.natural_key));
        record.food_group = clean_string(raw.get("Food Group"));
        record.is_csv_food = true;
        record.nutrients = self.nutrients(raw);
        record.measurements = self.measurements(raw);

        Normalized::Record(Box::new(record))
    }
}
