//! Canonical food record produced by the normalizers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity assigned to a food by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SinkId(pub i64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key used to recognise the same food across datasets: the case-folded
/// name plus its whole-number calorie count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    name: String,
    magnitude: i64,
}

impl NaturalKey {
    pub fn new(name: &str, magnitude: i64) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            magnitude,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn magnitude(&self) -> i64 {
        self.magnitude
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.magnitude)
    }
}

/// A serving size a food can be logged in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub name: String,
    pub abbreviation: String,
    pub unit: String,
    pub weight_in_grams: f64,
    pub is_default: bool,
    pub is_from_source: bool,
}

impl Measurement {
    /// "100 grams" (the default) and "1 gram", attached to every food
    pub fn defaults() -> Vec<Measurement> {
        vec![
            Measurement {
                name: "100 grams".to_string(),
                abbreviation: "100g".to_string(),
                unit: "g".to_string(),
                weight_in_grams: 100.0,
                is_default: true,
                is_from_source: true,
            },
            Measurement {
                name: "1 gram".to_string(),
                abbreviation: "1g".to_string(),
                unit: "g".to_string(),
                weight_in_grams: 1.0,
                is_default: false,
                is_from_source: true,
            },
        ]
    }
}

/// Nutrient amounts per 100 g.
///
/// Units follow the food table: macronutrients in grams, minerals and
/// fatty acids in milligrams, trace vitamins in micrograms. Missing values
/// are zero, never absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nutrients {
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub fiber: f64,
    pub sugar: f64,
    pub sodium: f64,
    pub saturated_fat: f64,
    pub trans_fat: f64,
    pub cholesterol: f64,
    pub added_sugar: f64,
    pub net_carbs: f64,
    pub soluble_fiber: f64,
    pub insoluble_fiber: f64,
    pub water: f64,
    pub pral_score: f64,
    pub omega3: f64,
    pub omega6: f64,
    pub mono_fat: f64,
    pub poly_fat: f64,
    pub ala: f64,
    pub epa: f64,
    pub dpa: f64,
    pub dha: f64,
    pub calcium: f64,
    pub iron: f64,
    pub potassium: f64,
    pub magnesium: f64,
    #[serde(rename = "vitaminAiu")]
    pub vitamin_a_iu: f64,
    #[serde(rename = "vitaminArae")]
    pub vitamin_a_rae: f64,
    pub vitamin_c: f64,
    pub vitamin_b12: f64,
    pub vitamin_d: f64,
    pub vitamin_d2: f64,
    pub vitamin_d3: f64,
    #[serde(rename = "vitaminDiu")]
    pub vitamin_d_iu: f64,
    pub vitamin_e: f64,
    pub phosphorus: f64,
    pub zinc: f64,
    pub copper: f64,
    pub manganese: f64,
    pub selenium: f64,
    pub fluoride: f64,
    pub molybdenum: f64,
    pub chlorine: f64,
    pub vitamin_b1: f64,
    pub vitamin_b2: f64,
    pub vitamin_b3: f64,
    pub vitamin_b5: f64,
    pub vitamin_b6: f64,
    pub biotin: f64,
    pub folate: f64,
    pub folic_acid: f64,
    pub food_folate: f64,
    pub folate_dfe: f64,
    pub vitamin_k: f64,
    pub dihydrophylloquinone: f64,
    pub menaquinone4: f64,
    pub choline: f64,
    pub betaine: f64,
    pub retinol: f64,
    pub carotene_beta: f64,
    pub carotene_alpha: f64,
    pub lycopene: f64,
    pub lutein_zeaxanthin: f64,
}

/// One food, cleaned and typed, ready to be batched.
///
/// Built once by a normalizer and not modified afterwards, apart from the
/// identity the match cache attaches before batching.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Stable identifier from the dataset, the upsert key in the store
    pub source_id: String,
    pub name: String,
    pub brand: Option<String>,
    pub food_group: Option<String>,
    pub barcode: Option<String>,
    pub calories: i32,
    /// Whether the food comes from the curated CSV dataset
    pub is_csv_food: bool,
    pub nutrients: Nutrients,
    pub measurements: Vec<Measurement>,
    pub natural_key: NaturalKey,
    /// Existing identity found for `natural_key` when the record was batched
    pub matched: Option<SinkId>,
}

impl NormalizedRecord {
    pub fn new(source_id: impl Into<String>, name: impl Into<String>, calories: i32) -> Self {
        let name = name.into();
        let natural_key = NaturalKey::new(&name, i64::from(calories));
        Self {
            source_id: source_id.into(),
            name,
            brand: None,
            food_group: None,
            barcode: None,
            calories,
            is_csv_food: false,
            nutrients: Nutrients::default(),
            measurements: Measurement::defaults(),
            natural_key,
            matched: None,
        }
    }

    pub fn with_matched(mut self, id: Option<SinkId>) -> Self {
        self.matched = id;
        self
    }
}
