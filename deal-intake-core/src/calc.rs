//! Calculated Field Engine
//!
//! Derives date values from other field values. Only three formula shapes
//! are accepted (unit words are case-insensitive):
//!
//! ```text
//! {A} + N months|days
//! {A} + {B} months|days
//! {A} + {B} + N months|days
//! ```
//!
//! `A` must hold an ISO date (`yyyy-MM-dd`) and `B` a finite number.
//! Fields are evaluated in ascending order of dependency count against a
//! working copy of the values, so a field computed early in a pass can feed
//! a more-dependent field later in the same pass. Cycles are not detected.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Days, Months, NaiveDate};
use regex::Regex;
use tracing::debug;

use crate::error::FormulaError;
use crate::types::{has_value, CalculatedField, CalculationResult, FieldValues};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Offsets beyond this many units cannot produce a calendar date.
const MAX_OFFSET: f64 = 1.0e9;

static STATIC_OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\{([^{}]+)\}\s*\+\s*(\d+)\s*(months|days)$").unwrap()
});

static FIELD_OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\{([^{}]+)\}\s*\+\s*\{([^{}]+)\}\s*(months|days)$").unwrap()
});

static FIELD_PLUS_OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\{([^{}]+)\}\s*\+\s*\{([^{}]+)\}\s*\+\s*(\d+)\s*(months|days)$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUnit {
    Months,
    Days,
}

impl DateUnit {
    fn parse(word: &str) -> Self {
        if word.eq_ignore_ascii_case("months") {
            Self::Months
        } else {
            Self::Days
        }
    }
}

/// How far to move the base date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offset {
    /// `{A} + N unit`
    Constant(i64),
    /// `{A} + {B} unit`
    Field(String),
    /// `{A} + {B} + N unit`
    FieldPlus(String, i64),
}

/// A parsed date-arithmetic formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    pub base: String,
    pub offset: Offset,
    pub unit: DateUnit,
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(caps) = FIELD_PLUS_OFFSET_RE.captures(s) {
            let base = caps[1].trim().to_string();
            let constant = parse_constant(&caps[3], &base)?;
            return Ok(Self {
                offset: Offset::FieldPlus(caps[2].trim().to_string(), constant),
                unit: DateUnit::parse(&caps[4]),
                base,
            });
        }

        if let Some(caps) = FIELD_OFFSET_RE.captures(s) {
            return Ok(Self {
                base: caps[1].trim().to_string(),
                offset: Offset::Field(caps[2].trim().to_string()),
                unit: DateUnit::parse(&caps[3]),
            });
        }

        if let Some(caps) = STATIC_OFFSET_RE.captures(s) {
            let base = caps[1].trim().to_string();
            let constant = parse_constant(&caps[2], &base)?;
            return Ok(Self {
                offset: Offset::Constant(constant),
                unit: DateUnit::parse(&caps[3]),
                base,
            });
        }

        Err(FormulaError::UnknownFormat)
    }
}

fn parse_constant(digits: &str, base: &str) -> Result<i64, FormulaError> {
    digits
        .parse::<i64>()
        .map_err(|_| FormulaError::OutOfRange {
            field_key: base.to_string(),
        })
}

impl Formula {
    /// Field keys the formula reads, base first.
    pub fn referenced_fields(&self) -> Vec<&str> {
        match &self.offset {
            Offset::Constant(_) => vec![self.base.as_str()],
            Offset::Field(b) | Offset::FieldPlus(b, _) => vec![self.base.as_str(), b.as_str()],
        }
    }

    /// Evaluate against a value snapshot, producing an ISO date string.
    pub fn evaluate(&self, values: &FieldValues) -> Result<String, FormulaError> {
        let raw_base = values.get(&self.base).map(|v| v.trim()).unwrap_or_default();
        let base = NaiveDate::parse_from_str(raw_base, DATE_FORMAT).map_err(|_| {
            FormulaError::InvalidDate {
                field_key: self.base.clone(),
                value: raw_base.to_string(),
            }
        })?;

        let amount = match &self.offset {
            Offset::Constant(n) => *n,
            Offset::Field(b) => parse_offset_value(b, values)?,
            Offset::FieldPlus(b, n) => parse_offset_value(b, values)?
                .checked_add(*n)
                .ok_or_else(|| self.out_of_range())?,
        };

        shift(base, amount, self.unit)
            .map(|d| d.format(DATE_FORMAT).to_string())
            .ok_or_else(|| self.out_of_range())
    }

    fn out_of_range(&self) -> FormulaError {
        FormulaError::OutOfRange {
            field_key: self.base.clone(),
        }
    }
}

/// Finite numbers only; fractional offsets truncate toward zero.
fn parse_offset_value(field_key: &str, values: &FieldValues) -> Result<i64, FormulaError> {
    let raw = values.get(field_key).map(|v| v.trim()).unwrap_or_default();
    let invalid = || FormulaError::InvalidNumber {
        field_key: field_key.to_string(),
        value: raw.to_string(),
    };
    let number: f64 = raw.parse().map_err(|_| invalid())?;
    if !number.is_finite() {
        return Err(invalid());
    }
    if number.abs() > MAX_OFFSET {
        return Err(FormulaError::OutOfRange {
            field_key: field_key.to_string(),
        });
    }
    Ok(number.trunc() as i64)
}

/// Month arithmetic clamps to the last day of the target month.
fn shift(date: NaiveDate, amount: i64, unit: DateUnit) -> Option<NaiveDate> {
    let magnitude = amount.unsigned_abs();
    match unit {
        DateUnit::Months => {
            let months = Months::new(u32::try_from(magnitude).ok()?);
            if amount >= 0 {
                date.checked_add_months(months)
            } else {
                date.checked_sub_months(months)
            }
        }
        DateUnit::Days => {
            let days = Days::new(magnitude);
            if amount >= 0 {
                date.checked_add_days(days)
            } else {
                date.checked_sub_days(days)
            }
        }
    }
}

/// Compute every calculated field in one pass. `values` is not modified.
pub fn compute_calculated_fields(
    fields: &[CalculatedField],
    values: &FieldValues,
) -> BTreeMap<String, CalculationResult> {
    let mut ordered: Vec<&CalculatedField> = fields.iter().collect();
    ordered.sort_by_key(|f| f.dependencies.len());

    let mut working = values.clone();
    let mut results = BTreeMap::new();

    for field in ordered {
        let result = evaluate_field(field, &working);
        if result.computed {
            if let Some(value) = &result.value {
                working.insert(field.field_key.clone(), value.clone());
            }
        }
        results.insert(field.field_key.clone(), result);
    }

    debug!(
        fields = fields.len(),
        computed = results.values().filter(|r| r.computed).count(),
        failed = results.values().filter(|r| r.error.is_some()).count(),
        "Calculated field pass"
    );
    results
}

fn evaluate_field(field: &CalculatedField, values: &FieldValues) -> CalculationResult {
    if field.dependencies.iter().any(|d| !has_value(values, d)) {
        return CalculationResult::waiting(&field.field_key);
    }

    let formula = match field.formula.parse::<Formula>() {
        Ok(formula) => formula,
        Err(e) => return CalculationResult::failed(&field.field_key, e),
    };

    // Undeclared references that are still empty are waiting, not malformed.
    if formula
        .referenced_fields()
        .into_iter()
        .any(|k| !has_value(values, k))
    {
        return CalculationResult::waiting(&field.field_key);
    }

    match formula.evaluate(values) {
        Ok(value) => CalculationResult::computed(&field.field_key, value),
        Err(e) => CalculationResult::failed(&field.field_key, e),
    }
}

/// Overlay successful results onto `values`. Failed and waiting keys keep
/// whatever was stored before.
pub fn merge_calculated_values(
    values: &FieldValues,
    results: &BTreeMap<String, CalculationResult>,
) -> FieldValues {
    let mut merged = values.clone();
    for (key, result) in results {
        if !result.computed {
            continue;
        }
        if let Some(value) = &result.value {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
