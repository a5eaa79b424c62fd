//! Field declarations and the schema checker.
//!
//! A [`FieldSpecMap`] is declared once per resource and used twice: as the
//! contract for request parameters ([`check_params`]) and as the contract for
//! the columns of a fetched [`Table`] ([`check_result`]).
//!
//! Both checks are pure. A missing or empty spec is permissive so resources
//! can opt out of validation while their declarations are being written.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::table::Table;
use crate::types::ValueType;
use crate::values::{Record, Value};

/// Field name -> declaration.
pub type FieldSpecMap = BTreeMap<String, FieldSpec>;

/// Declaration of a single field.
///
/// # YAML Format
///
/// ```yaml
/// amount:
///   types: [number]
///   values: []
///   required: true
///   label: Total Amount
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    /// Accepted runtime types; empty accepts any type
    #[serde(default)]
    pub types: Vec<ValueType>,

    /// Accepted values; empty is unconstrained
    #[serde(default)]
    pub values: Vec<Value>,

    /// Whether the field must be present
    #[serde(default)]
    pub required: bool,

    /// Human-readable label
    #[serde(default)]
    pub label: String,
}

impl FieldSpec {
    /// A required field of the given types.
    pub fn required(types: Vec<ValueType>) -> Self {
        Self {
            types,
            required: true,
            ..Self::default()
        }
    }

    /// An optional field of the given types.
    pub fn optional(types: Vec<ValueType>) -> Self {
        Self {
            types,
            ..Self::default()
        }
    }

    /// Restrict the field to a set of values.
    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values = values;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn check_value(&self, field: &str, value: &Value) -> Result<(), FieldViolation> {
        if !self.types.is_empty() && !self.types.iter().any(|t| t.accepts(value)) {
            return Err(FieldViolation {
                field: field.to_string(),
                reason: ViolationReason::TypeMismatch {
                    expected: self.types.clone(),
                    found: ValueType::of(value),
                },
            });
        }
        if !self.values.is_empty()
            && !self
                .values
                .iter()
                .any(|allowed| allowed.compare(value) == Some(std::cmp::Ordering::Equal))
        {
            return Err(FieldViolation {
                field: field.to_string(),
                reason: ViolationReason::ValueNotAllowed(value.to_string()),
            });
        }
        Ok(())
    }
}

/// Why a field failed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ViolationReason {
    Missing,
    TypeMismatch {
        expected: Vec<ValueType>,
        found: ValueType,
    },
    ValueNotAllowed(String),
}

impl std::fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => f.write_str("required field is missing"),
            Self::TypeMismatch { expected, found } => {
                let expected: Vec<&str> = expected.iter().map(|t| t.as_str()).collect();
                write!(f, "expected one of [{}], found {found}", expected.join(", "))
            }
            Self::ValueNotAllowed(value) => write!(f, "value '{value}' is not allowed"),
        }
    }
}

/// The first field that failed a check.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("field '{field}': {reason}")]
pub struct FieldViolation {
    pub field: String,
    pub reason: ViolationReason,
}

/// Validate a request mapping, reporting the first violation.
pub fn validate_params(values: &Record, spec: Option<&FieldSpecMap>) -> Result<(), FieldViolation> {
    let Some(spec) = spec else {
        return Ok(());
    };
    for (field, field_spec) in spec {
        match values.get(field) {
            Some(value) => field_spec.check_value(field, value)?,
            None if field_spec.required => {
                return Err(FieldViolation {
                    field: field.clone(),
                    reason: ViolationReason::Missing,
                })
            }
            None => {}
        }
    }
    Ok(())
}

/// Validate every column of a tabular result, reporting the first violation.
///
/// A declared column the table does not carry fails only when required. For
/// a carried column every cell is checked, missing cells counting as null.
pub fn validate_result(table: &Table, spec: Option<&FieldSpecMap>) -> Result<(), FieldViolation> {
    let Some(spec) = spec else {
        return Ok(());
    };
    for (field, field_spec) in spec {
        if !table.has_column(field) {
            if field_spec.required {
                return Err(FieldViolation {
                    field: field.clone(),
                    reason: ViolationReason::Missing,
                });
            }
            continue;
        }
        for value in table.column(field) {
            field_spec.check_value(field, value)?;
        }
    }
    Ok(())
}

/// Boolean form of [`validate_params`]; logs the violation.
pub fn check_params(values: &Record, spec: Option<&FieldSpecMap>) -> bool {
    match validate_params(values, spec) {
        Ok(()) => true,
        Err(violation) => {
            debug!("Parameter check failed: {violation}");
            false
        }
    }
}

/// Boolean form of [`validate_result`]; logs the violation.
pub fn check_result(table: &Table, spec: Option<&FieldSpecMap>) -> bool {
    match validate_result(table, spec) {
        Ok(()) => true,
        Err(violation) => {
            debug!("Result check failed: {violation}");
            false
        }
    }
}
