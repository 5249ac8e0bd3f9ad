//! Payload validation against runtime-defined metatype keys.
//!
//! A key set is compiled once into a [`CompiledSchema`] (patterns compiled,
//! definitions checked) and then applied to raw property maps. Validation is a
//! pure function of the schema and the payload: every failing property is
//! reported together, and properties no key mentions pass through unchanged.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::schema::{DataType, MetatypeKey};
use crate::types::PropertyMap;

/// Why a single property (or key definition) was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationReason {
    #[error("required property is missing")]
    MissingRequired,
    #[error("expected a value of type {expected}")]
    TypeMismatch { expected: DataType },
    #[error("value is not one of the allowed options {options:?}")]
    NotAnOption { options: Vec<String> },
    #[error("value does not match pattern {pattern}")]
    PatternMismatch { pattern: String },
    #[error("value is below the minimum of {min}")]
    BelowMinimum { min: f64 },
    #[error("value is above the maximum of {max}")]
    AboveMaximum { max: f64 },
    #[error("default value is invalid: {reason}")]
    InvalidDefault { reason: Box<ValidationReason> },
    #[error("invalid pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("enumeration key has no options")]
    MissingOptions,
    #[error("property name is used by more than one key")]
    DuplicateProperty,
    #[error("property name is empty")]
    EmptyPropertyName,
}

/// A rejected property together with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyError {
    pub property: String,
    pub reason: ValidationReason,
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.property, self.reason)
    }
}

/// Every problem found in one payload (or key set), never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub errors: Vec<PropertyError>,
}

impl ValidationFailure {
    /// Whether `property` is among the rejected properties.
    #[must_use]
    pub fn mentions(&self, property: &str) -> bool {
        self.errors.iter().any(|e| e.property == property)
    }

    /// Reasons recorded for `property`, in key order.
    pub fn reasons_for<'a>(
        &'a self,
        property: &'a str,
    ) -> impl Iterator<Item = &'a ValidationReason> + 'a {
        self.errors
            .iter()
            .filter(move |e| e.property == property)
            .map(|e| &e.reason)
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed for {} propert", self.errors.len())?;
        f.write_str(if self.errors.len() == 1 { "y" } else { "ies" })?;
        for (i, error) in self.errors.iter().enumerate() {
            f.write_str(if i == 0 { ": " } else { "; " })?;
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationFailure {}

struct CompiledKey {
    key: MetatypeKey,
    pattern: Option<Regex>,
}

/// A metatype's key set, ready to validate payloads.
pub struct CompiledSchema {
    keys: Vec<CompiledKey>,
}

impl CompiledSchema {
    /// Checks the key definitions and compiles their patterns.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationFailure`] listing every malformed key: empty or
    /// duplicated property names, enumerations without options, patterns that
    /// do not compile, and default values that fail their own key.
    pub fn compile(keys: &[MetatypeKey]) -> Result<Self, ValidationFailure> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(keys.len());

        for key in keys {
            let fail = |reason| PropertyError {
                property: key.property_name.clone(),
                reason,
            };

            if key.property_name.trim().is_empty() {
                errors.push(fail(ValidationReason::EmptyPropertyName));
                continue;
            }
            if !seen.insert(key.property_name.as_str()) {
                errors.push(fail(ValidationReason::DuplicateProperty));
                continue;
            }
            if key.data_type == DataType::Enumeration && key.options.is_empty() {
                errors.push(fail(ValidationReason::MissingOptions));
                continue;
            }

            let pattern = match key.validation.as_ref().and_then(|v| v.regex.as_deref()) {
                Some(raw) if key.data_type.is_textual() => match anchored(raw) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        errors.push(fail(ValidationReason::InvalidPattern {
                            pattern: raw.to_string(),
                            message: e.to_string(),
                        }));
                        continue;
                    }
                },
                _ => None,
            };

            let entry = CompiledKey {
                key: key.clone(),
                pattern,
            };
            if let Some(default) = &key.default_value {
                if let Err(reason) = entry.coerce(default) {
                    errors.push(fail(ValidationReason::InvalidDefault {
                        reason: Box::new(reason),
                    }));
                    continue;
                }
            }
            compiled.push(entry);
        }

        if errors.is_empty() {
            Ok(Self { keys: compiled })
        } else {
            Err(ValidationFailure { errors })
        }
    }

    /// The keys this schema was compiled from, in order.
    pub fn keys(&self) -> impl Iterator<Item = &MetatypeKey> {
        self.keys.iter().map(|k| &k.key)
    }

    /// Validates `raw` and returns the normalized property map.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationFailure`] naming every property that is missing,
    /// fails coercion, or violates an option list, pattern or range.
    pub fn validate(&self, raw: &PropertyMap) -> Result<PropertyMap, ValidationFailure> {
        let mut normalized = raw.clone();
        let mut errors = Vec::new();

        for compiled in &self.keys {
            let key = &compiled.key;
            let name = &key.property_name;
            let supplied = raw.get(name).filter(|v| !v.is_null());

            let candidate = match (supplied, &key.default_value) {
                (Some(value), _) | (None, Some(value)) => value,
                (None, None) => {
                    normalized.remove(name);
                    if key.required {
                        errors.push(PropertyError {
                            property: name.clone(),
                            reason: ValidationReason::MissingRequired,
                        });
                    }
                    continue;
                }
            };

            match compiled.coerce(candidate) {
                Ok(value) => {
                    normalized.insert(name.clone(), value);
                }
                Err(reason) => {
                    normalized.remove(name);
                    errors.push(PropertyError {
                        property: name.clone(),
                        reason,
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(normalized)
        } else {
            Err(ValidationFailure { errors })
        }
    }
}

/// Compiles and applies `keys` in one step.
///
/// # Errors
///
/// See [`CompiledSchema::compile`] and [`CompiledSchema::validate`].
pub fn validate(keys: &[MetatypeKey], raw: &PropertyMap) -> Result<PropertyMap, ValidationFailure> {
    CompiledSchema::compile(keys)?.validate(raw)
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

impl CompiledKey {
    fn coerce(&self, value: &Value) -> Result<Value, ValidationReason> {
        let key = &self.key;
        let mismatch = || ValidationReason::TypeMismatch {
            expected: key.data_type,
        };

        match key.data_type {
            DataType::String => {
                let text = scalar_text(value).ok_or_else(mismatch)?;
                self.check_text(&text)?;
                Ok(Value::String(text))
            }
            DataType::File => match value {
                Value::String(s) if !s.trim().is_empty() => {
                    self.check_text(s)?;
                    Ok(value.clone())
                }
                _ => Err(mismatch()),
            },
            DataType::Date => match value {
                Value::String(s) if is_date(s) => {
                    self.check_text(s)?;
                    Ok(value.clone())
                }
                _ => Err(mismatch()),
            },
            DataType::Number => {
                let number = match value {
                    Value::Number(n) => n.clone(),
                    Value::String(s) => parse_number(s.trim()).ok_or_else(mismatch)?,
                    _ => return Err(mismatch()),
                };
                if let Some(as_f64) = number.as_f64() {
                    self.check_range(as_f64)?;
                }
                Ok(Value::Number(number))
            }
            DataType::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            DataType::Enumeration => {
                let text = scalar_text(value).ok_or_else(mismatch)?;
                if key.options.iter().any(|o| *o == text) {
                    Ok(Value::String(text))
                } else {
                    Err(ValidationReason::NotAnOption {
                        options: key.options.clone(),
                    })
                }
            }
        }
    }

    fn check_text(&self, text: &str) -> Result<(), ValidationReason> {
        if let Some(re) = &self.pattern {
            if !re.is_match(text) {
                return Err(ValidationReason::PatternMismatch {
                    pattern: self
                        .key
                        .validation
                        .as_ref()
                        .and_then(|v| v.regex.clone())
                        .unwrap_or_default(),
                });
            }
        }
        // Character counts are far below f64's exact integer range.
        #[allow(clippy::cast_precision_loss)]
        let length = text.chars().count() as f64;
        self.check_range(length)
    }

    fn check_range(&self, value: f64) -> Result<(), ValidationReason> {
        let Some(validation) = &self.key.validation else {
            return Ok(());
        };
        if let Some(min) = validation.min {
            if value < min {
                return Err(ValidationReason::BelowMinimum { min });
            }
        }
        if let Some(max) = validation.max {
            if value > max {
                return Err(ValidationReason::AboveMaximum { max });
            }
        }
        Ok(())
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
}

fn is_date(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok() || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}
