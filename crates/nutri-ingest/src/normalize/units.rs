//! Unit conversions applied during normalization
//!
//! All conversions are pure and deterministic; the thresholds below are the
//! only heuristics involved.

/// Kilojoules per kilocalorie
pub const KJ_PER_KCAL: f64 = 4.184;

/// Fraction of table salt that is sodium, by weight
pub const SODIUM_FRACTION_OF_SALT: f64 = 0.4;

/// Largest value still read as grams by [`maybe_grams_to_mg`]
pub const GRAM_HEURISTIC_MAX: f64 = 10.0;

pub fn grams_to_mg(grams: f64) -> f64 {
    grams * 1000.0
}

/// Fatty acids and cholesterol are published in either unit.
///
/// A value ≤ 10 is taken to be grams and multiplied by 1000; anything
/// larger is assumed to already be milligrams.
pub fn maybe_grams_to_mg(value: f64) -> f64 {
    if value <= GRAM_HEURISTIC_MAX {
        grams_to_mg(value)
    } else {
        value
    }
}

/// Whole kilocalories from either a kcal value or a kJ value.
///
/// A positive kcal value wins; otherwise kJ / 4.184 is used. Both are
/// rounded half away from zero. Returns 0 when neither is positive.
pub fn calories(kcal: f64, kj: f64) -> i32 {
    if kcal > 0.0 {
        round_to_i32(kcal)
    } else if kj > 0.0 {
        round_to_i32(kj / KJ_PER_KCAL)
    } else {
        0
    }
}

/// Sodium in milligrams from sodium grams, or derived from salt grams when
/// no positive sodium value is published.
pub fn sodium_mg(sodium_g: f64, salt_g: f64) -> f64 {
    if sodium_g > 0.0 {
        grams_to_mg(sodium_g)
    } else if salt_g > 0.0 {
        grams_to_mg(salt_g) * SODIUM_FRACTION_OF_SALT
    } else {
        0.0
    }
}

/// Saturating conversion; non-finite input becomes 0
pub fn round_to_i32(value: f64) -> i32 {
    if value.is_finite() {
        value.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
    } else {
        0
    }
}
