//! Field value validation
//!
//! Checks a submitted value against its dictionary data type and optional
//! `validation_rule`. Blank values always pass so a field can be cleared.

use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

use crate::error::IntakeError;
use crate::types::{DataType, FieldDefinition};

// =============================================================================
// PATTERNS
// =============================================================================

/// One `@`, non-empty local part, dotted domain
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s.]+(\.[^@\s.]+)+$").unwrap());

/// Formatting characters tolerated in phone and SSN entry
static DIGIT_SEPARATORS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s().+\-]").unwrap());

// =============================================================================
// VALIDATION
// =============================================================================

/// Validate one submitted value for `definition`.
pub fn validate_value(definition: &FieldDefinition, value: &str) -> Result<(), IntakeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(());
    }

    if !definition.data_type.holds_value() {
        return Err(IntakeError::validation(
            &definition.field_key,
            "display-only field cannot hold a value",
        ));
    }
    check_data_type(definition.data_type, trimmed)
        .map_err(|message| IntakeError::validation(&definition.field_key, message))?;

    if let Some(rule) = &definition.validation_rule {
        match Regex::new(rule) {
            Ok(re) if !re.is_match(trimmed) => {
                return Err(IntakeError::validation(
                    &definition.field_key,
                    format!("does not match required format {rule}"),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    field_key = %definition.field_key,
                    error = %e,
                    "Ignoring invalid validation rule"
                );
            }
        }
    }

    Ok(())
}

fn check_data_type(data_type: DataType, value: &str) -> Result<(), String> {
    match data_type {
        DataType::Number | DataType::Percentage => parse_decimal(value.trim_end_matches('%'))
            .map(|_| ())
            .ok_or_else(|| "expected a number".to_string()),
        DataType::Currency => {
            let cleaned: String = value.chars().filter(|c| *c != '$' && *c != ',').collect();
            parse_decimal(&cleaned)
                .map(|_| ())
                .ok_or_else(|| "expected a currency amount".to_string())
        }
        DataType::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(|_| ())
            .map_err(|_| "expected a date as yyyy-MM-dd".to_string()),
        DataType::Boolean => match value.to_ascii_lowercase().as_str() {
            "true" | "false" | "yes" | "no" | "1" | "0" => Ok(()),
            _ => Err("expected true/false or yes/no".to_string()),
        },
        DataType::Email => {
            if EMAIL_RE.is_match(value) {
                Ok(())
            } else {
                Err("expected an email address".to_string())
            }
        }
        DataType::Phone => check_digits(value, 10, "expected a 10-digit phone number"),
        DataType::Ssn => check_digits(value, 9, "expected a 9-digit SSN"),
        _ => Ok(()),
    }
}

fn parse_decimal(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn check_digits(value: &str, expected: usize, message: &str) -> Result<(), String> {
    let stripped = DIGIT_SEPARATORS_RE.replace_all(value, "");
    if stripped.len() == expected && stripped.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(message.to_string())
    }
}
