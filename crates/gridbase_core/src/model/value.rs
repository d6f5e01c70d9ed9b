//! Record value coercion against column types.
//!
//! # Responsibility
//! - Coerce one JSON value into the canonical shape of its column type.
//! - Apply per-column `ColumnValidations` after coercion.
//!
//! # Invariants
//! - One exhaustive match over `ColumnType` decides acceptance.
//! - Foreign-key existence is not checked here; the record store resolves it.
//! - Callers treat `is_empty_value` values as missing before coercing.

use crate::model::schema::{Column, ColumnOption, ColumnType, ColumnValidations};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde_json::{Number, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Why a single value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// The value cannot be read as the declared type.
    TypeMismatch {
        expected: &'static str,
        message: String,
    },
    /// The value has the right type but breaks a constraint.
    Invalid(String),
}

impl Display for ValueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeMismatch { expected, message } => {
                write!(f, "expected {expected}: {message}")
            }
            Self::Invalid(message) => write!(f, "{message}"),
        }
    }
}

impl Error for ValueError {}

/// Returns whether a value counts as missing for required checks.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Coerces `value` to the canonical representation for `column`.
///
/// `options` are the declared choices of `column`; ignored for non-select types.
pub fn coerce_value(
    column: &Column,
    options: &[ColumnOption],
    value: &Value,
) -> Result<Value, ValueError> {
    let coerced = match &column.column_type {
        ColumnType::String => match value {
            Value::String(text) => Value::String(text.clone()),
            other => return Err(mismatch("string", other)),
        },
        ColumnType::Number => Value::Number(coerce_number(value)?),
        ColumnType::Boolean => Value::Bool(coerce_bool(value)?),
        ColumnType::Date => Value::String(coerce_date(value)?),
        ColumnType::Select { multiple: false } => {
            Value::String(coerce_option(options, value)?)
        }
        ColumnType::Select { multiple: true } => {
            let items = match value {
                Value::Array(items) => items.as_slice(),
                single @ Value::String(_) => std::slice::from_ref(single),
                other => return Err(mismatch("array of options", other)),
            };
            let mut chosen: Vec<Value> = Vec::with_capacity(items.len());
            for item in items {
                let option = Value::String(coerce_option(options, item)?);
                if !chosen.contains(&option) {
                    chosen.push(option);
                }
            }
            Value::Array(chosen)
        }
        ColumnType::ForeignKey { .. } => match value {
            Value::String(text) => Value::String(text.trim().to_string()),
            Value::Number(number) => Value::String(number.to_string()),
            other => return Err(mismatch("record reference", other)),
        },
        ColumnType::UserLink => match value {
            Value::String(text) => Value::String(text.trim().to_string()),
            other => return Err(mismatch("user id", other)),
        },
    };

    apply_validations(&column.column_type, &column.validations, &coerced)?;
    Ok(coerced)
}

/// Parses a stored date value (`YYYY-MM-DD` or RFC 3339) into UTC.
///
/// Date-only values resolve to midnight UTC.
pub fn parse_date_value(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&midnight));
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

fn coerce_number(value: &Value) -> Result<Number, ValueError> {
    match value {
        Value::Number(number) => Ok(number.clone()),
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(integer) = trimmed.parse::<i64>() {
                return Ok(Number::from(integer));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .ok_or_else(|| mismatch("number", value))
        }
        other => Err(mismatch("number", other)),
    }
}

fn coerce_bool(value: &Value) -> Result<bool, ValueError> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(mismatch("boolean", value)),
        },
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(mismatch("boolean", value)),
        },
        other => Err(mismatch("boolean", other)),
    }
}

fn coerce_date(value: &Value) -> Result<String, ValueError> {
    let Value::String(text) = value else {
        return Err(mismatch("date", value));
    };
    let trimmed = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
        return Ok(date.format(DATE_FORMAT).to_string());
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|parsed| {
            parsed
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        })
        .map_err(|_| mismatch("date", value))
}

fn coerce_option(options: &[ColumnOption], value: &Value) -> Result<String, ValueError> {
    let Value::String(text) = value else {
        return Err(mismatch("option value", value));
    };
    let trimmed = text.trim();
    if options.iter().any(|option| option.option_value == trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(ValueError::Invalid(format!(
            "`{trimmed}` is not one of the declared options"
        )))
    }
}

/// Numeric bounds apply to number columns; length and pattern rules apply
/// to free-text columns only, never to canonical dates, options or references.
fn apply_validations(
    column_type: &ColumnType,
    rules: &ColumnValidations,
    value: &Value,
) -> Result<(), ValueError> {
    match (column_type, value) {
        (ColumnType::Number, Value::Number(number)) => {
            let Some(current) = number.as_f64() else {
                return Ok(());
            };
            if let Some(min) = rules.min {
                if current < min {
                    return Err(ValueError::Invalid(format!(
                        "value {current} is below minimum {min}"
                    )));
                }
            }
            if let Some(max) = rules.max {
                if current > max {
                    return Err(ValueError::Invalid(format!(
                        "value {current} is above maximum {max}"
                    )));
                }
            }
        }
        (ColumnType::String | ColumnType::UserLink, Value::String(text)) => {
            if let Some(max_length) = rules.max_length {
                if text.chars().count() > max_length {
                    return Err(ValueError::Invalid(format!(
                        "value is longer than {max_length} characters"
                    )));
                }
            }
            if let Some(pattern) = &rules.pattern {
                let re = Regex::new(pattern)
                    .map_err(|err| ValueError::Invalid(format!("invalid pattern: {err}")))?;
                if !re.is_match(text) {
                    return Err(ValueError::Invalid(format!(
                        "value does not match pattern `{pattern}`"
                    )));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn mismatch(expected: &'static str, value: &Value) -> ValueError {
    ValueError::TypeMismatch {
        expected,
        message: format!("cannot read {} as {expected}", describe(value)),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "a boolean".to_string(),
        Value::Number(number) => format!("number {number}"),
        Value::String(text) => {
            let preview: String = text.chars().take(32).collect();
            format!("string `{preview}`")
        }
        Value::Array(_) => "an array".to_string(),
        Value::Object(_) => "an object".to_string(),
    }
}
