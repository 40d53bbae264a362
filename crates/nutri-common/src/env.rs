//! Environment lookups
//!
//! Values are read from the process environment after an optional `.env`
//! file has been merged in with [`load_dotenv`]. Variables that are set but
//! blank are treated the same as unset ones.

use crate::error::{CommonError, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Merge the nearest `.env` file into the process environment.
///
/// Existing variables win over file entries. Returns the path that was
/// loaded, if any.
pub fn load_dotenv() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

/// Trimmed value of `key`, or `None` when unset or blank
pub fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parse `key` into `T`, falling back to `default` when it is unset.
///
/// A value that is present but does not parse is an error rather than a
/// silent fallback.
pub fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    Ok(parse_opt(key)?.unwrap_or(default))
}

/// Parse `key` into `T` when it is set
pub fn parse_opt<T: FromStr>(key: &str) -> Result<Option<T>> {
    match var(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| CommonError::invalid(key, raw)),
        None => Ok(None),
    }
}

/// Interpret `key` as a boolean switch (`1`, `true`, `yes`, `on`)
pub fn flag(key: &str, default: bool) -> bool {
    match var(key) {
        Some(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

/// Values of every key in `keys`, in order.
///
/// Fails with [`CommonError::MissingSettings`] naming all missing keys at
/// once so an operator can fix the `.env` file in a single pass.
pub fn require(keys: &[&str]) -> Result<Vec<String>> {
    let mut values = Vec::with_capacity(keys.len());
    let mut missing = Vec::new();

    for key in keys {
        match var(key) {
            Some(value) => values.push(value),
            None => missing.push((*key).to_string()),
        }
    }

    if missing.is_empty() {
        Ok(values)
    } else {
        Err(CommonError::MissingSettings(missing))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_var_treats_blank_as_unset() {
        std::env::set_var("NUTRI_TEST_ENV_BLANK", "   ");
        assert_eq!(var("NUTRI_TEST_ENV_BLANK"), None);

        std::env::set_var("NUTRI_TEST_ENV_PADDED", "  value ");
        assert_eq!(var("NUTRI_TEST_ENV_PADDED").as_deref(), Some("value"));
    }

    #[test]
    fn test_parse_var_default_and_invalid() {
        assert_eq!(parse_var::<u16>("NUTRI_TEST_ENV_UNSET_PORT", 5432).unwrap(), 5432);

        std::env::set_var("NUTRI_TEST_ENV_PORT", "6543");
        assert_eq!(parse_var::<u16>("NUTRI_TEST_ENV_PORT", 5432).unwrap(), 6543);

        std::env::set_var("NUTRI_TEST_ENV_BAD_PORT", "not-a-port");
        let err = parse_var::<u16>("NUTRI_TEST_ENV_BAD_PORT", 5432).unwrap_err();
        assert!(matches!(err, CommonError::InvalidSetting { ref key, .. } if key == "NUTRI_TEST_ENV_BAD_PORT"));
    }

    #[test]
    fn test_flag() {
        std::env::set_var("NUTRI_TEST_ENV_FLAG_ON", "Yes");
        std::env::set_var("NUTRI_TEST_ENV_FLAG_OFF", "0");
        assert!(flag("NUTRI_TEST_ENV_FLAG_ON", false));
        assert!(!flag("NUTRI_TEST_ENV_FLAG_OFF", true));
        assert!(flag("NUTRI_TEST_ENV_FLAG_UNSET", true));
    }

    #[test]
    fn test_require_reports_all_missing_keys() {
        std::env::set_var("NUTRI_TEST_ENV_REQ_A", "a");
        let err = require(&[
            "NUTRI_TEST_ENV_REQ_A",
            "NUTRI_TEST_ENV_REQ_B",
            "NUTRI_TEST_ENV_REQ_C",
        ])
        .unwrap_err();

        match err {
            CommonError::MissingSettings(keys) => {
                assert_eq!(keys, vec!["NUTRI_TEST_ENV_REQ_B", "NUTRI_TEST_ENV_REQ_C"]);
            },
            other => panic!("unexpected error: {other}"),
        }

        let values = require(&["NUTRI_TEST_ENV_REQ_A"]).unwrap();
        assert_eq!(values, vec!["a"]);
    }
}
