//! Column types and schemas.
//!
//! A column type is a tag identifying a scalar family plus a default value.
//! There is no runtime representation beyond the tag; values themselves are
//! `Scalar`, a uniform sum type over the handful of primitive kinds the
//! store supports.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::RetrodbError;

/// A scalar value stored in a record's field.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// A UTF-8 string.
    Str(String),
    /// A boolean.
    Bool(bool),
}

impl Scalar {
    /// Adds two scalars of the same numeric variant.
    ///
    /// Only ever called by `SumView` on fields that were checked `Numeric`
    /// at construction, so mismatched variants indicate a bug upstream
    /// rather than a user-triggerable condition.
    pub(crate) fn add(&self, other: &Scalar) -> Scalar {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => Scalar::Int(a + b),
            (Scalar::Float(a), Scalar::Float(b)) => Scalar::Float(a + b),
            _ => panic!("Scalar::add called on non-numeric or mismatched variants"),
        }
    }

    /// Subtracts `other` from `self`, numeric variants only.
    pub(crate) fn sub(&self, other: &Scalar) -> Scalar {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => Scalar::Int(a - b),
            (Scalar::Float(a), Scalar::Float(b)) => Scalar::Float(a - b),
            _ => panic!("Scalar::sub called on non-numeric or mismatched variants"),
        }
    }
}

/// A mapping of field name to value. Every `Record` carries exactly its
/// schema's fields in one of these.
pub type FieldMap = FxHashMap<String, Scalar>;

/// Declares a scalar family and its default value.
///
/// `Numeric` is a marker sub-capability required by `SUM`; column types
/// report it via `is_numeric` rather than through a separate downcast, since
/// the only thing any caller ever needs to know is whether arithmetic is
/// legal on values of this type.
pub trait ColumnType: fmt::Debug + Send + Sync {
    /// The type's name, for diagnostics.
    fn name(&self) -> &'static str;

    /// The default value used for fields omitted from a mutator call.
    fn default_value(&self) -> Scalar;

    /// Whether this column type satisfies the `Numeric` capability required
    /// by `SUM`.
    fn is_numeric(&self) -> bool {
        false
    }
}

/// A 64-bit signed integer column. `Numeric`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntColumn;

impl ColumnType for IntColumn {
    fn name(&self) -> &'static str {
        "Int"
    }
    fn default_value(&self) -> Scalar {
        Scalar::Int(0)
    }
    fn is_numeric(&self) -> bool {
        true
    }
}

/// A 64-bit float column. `Numeric`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloatColumn;

impl ColumnType for FloatColumn {
    fn name(&self) -> &'static str {
        "Float"
    }
    fn default_value(&self) -> Scalar {
        Scalar::Float(0.0)
    }
    fn is_numeric(&self) -> bool {
        true
    }
}

/// A string column. Not `Numeric`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringColumn;

impl ColumnType for StringColumn {
    fn name(&self) -> &'static str {
        "String"
    }
    fn default_value(&self) -> Scalar {
        Scalar::Str(String::new())
    }
}

/// A boolean column. Not `Numeric`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolColumn;

impl ColumnType for BoolColumn {
    fn name(&self) -> &'static str {
        "Bool"
    }
    fn default_value(&self) -> Scalar {
        Scalar::Bool(false)
    }
}

/// An ordered, immutable mapping of field name to column type.
///
/// Field names are unique within a schema; order is preserved so views can
/// report their projected fields in declaration order.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<(String, Arc<dyn ColumnType>)>,
}

impl Schema {
    /// Builds a schema from an ordered list of `(field, column type)` pairs.
    ///
    /// Fails with `TableInitError` if a field name repeats.
    pub fn new(fields: Vec<(String, Arc<dyn ColumnType>)>) -> Result<Self, RetrodbError> {
        let mut seen = std::collections::HashSet::new();
        for (name, _) in &fields {
            if !seen.insert(name.clone()) {
                return Err(RetrodbError::TableInit(format!(
                    "duplicate field `{}`",
                    name
                )));
            }
        }
        Ok(Schema { fields })
    }

    /// Builds a single-field schema. Used internally by views that emit a
    /// synthetic column (e.g. `SUM`'s `SUM(<field>)` output).
    pub(crate) fn single(name: impl Into<String>, column: Arc<dyn ColumnType>) -> Self {
        Schema {
            fields: vec![(name.into(), column)],
        }
    }

    /// Returns the column type for `field`, if declared.
    pub fn get(&self, field: &str) -> Option<&Arc<dyn ColumnType>> {
        self.fields.iter().find(|(n, _)| n == field).map(|(_, c)| c)
    }

    /// Whether `field` is part of this schema.
    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Field names, in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Builds a `FieldMap` of every field set to its column type's default.
    pub fn default_values(&self) -> FieldMap {
        self.fields
            .iter()
            .map(|(name, col)| (name.clone(), col.default_value()))
            .collect()
    }

    /// Validates that `supplied` field names are all present in the schema,
    /// returning the unknown ones joined as a single `InvalidField` error.
    pub(crate) fn validate_fields<'a>(
        &self,
        supplied: impl Iterator<Item = &'a str>,
    ) -> Result<(), RetrodbError> {
        let unknown: Vec<&str> = supplied.filter(|f| !self.contains(f)).collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(RetrodbError::InvalidField(unknown.join(", ")))
        }
    }
}
