//! Field type system: column kinds, field specifications and value coercion.
//!
//! Coercion is pure and deterministic - no I/O happens here. Raw values
//! arrive as JSON from the submission interface and leave as [`FieldValue`]s
//! ready to be bound as SQL parameters.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::model::{ModelDescriptor, Record};
use crate::{Error, Result};

/// The closed set of column kinds a field can have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Integer,
    Text,
    Real,
    Blob,
}

impl FieldKind {
    /// The SQLite column type this kind maps to
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::Integer => "INTEGER",
            FieldKind::Text => "TEXT",
            FieldKind::Real => "REAL",
            FieldKind::Blob => "BLOB",
        }
    }
}

/// One declared column: kind plus modifiers. Immutable once the owning
/// descriptor is built.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    pub nullable: bool,
    /// `(target model, target field)` when this field references another model
    pub foreign_key: Option<(String, String)>,
}

impl FieldSpec {
    /// A plain column of the given kind, no modifiers
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            primary_key: false,
            auto_increment: false,
            unique: false,
            nullable: false,
            foreign_key: None,
        }
    }

    /// The implicit identifier column every model carries
    pub fn id() -> Self {
        Self {
            primary_key: true,
            auto_increment: true,
            ..Self::new(FieldKind::Integer)
        }
    }

    /// An Integer column referencing `model`'s identifier field
    pub fn reference(model: &str) -> Self {
        Self {
            foreign_key: Some((model.to_string(), "id".to_string())),
            ..Self::new(FieldKind::Integer)
        }
    }
}

/// Map a type name from the schema-submission interface to a field spec.
///
/// A name matching a registered model becomes an Integer foreign key to
/// that model's `id`. Unknown names default to Text, so callers can send
/// e.g. `Uuid` and get a plain text column.
pub fn spec_for_type_name(type_name: &str, known_models: &HashSet<String>) -> FieldSpec {
    if known_models.contains(type_name) {
        return FieldSpec::reference(type_name);
    }
    let kind = match type_name {
        "Integer" | "Boolean" => FieldKind::Integer,
        "Float" => FieldKind::Real,
        // SQLite has no native DATE type; arrays are stored joined as text
        "String" | "Date" | "Array" => FieldKind::Text,
        "Binary" => FieldKind::Blob,
        _ => FieldKind::Text,
    };
    FieldSpec::new(kind)
}

/// A typed value held by a record field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    /// A hydrated referenced record, produced by foreign-key read expansion
    Record(Box<Record>),
}

impl FieldValue {
    /// JSON representation for the external boundary
    pub fn to_json(&self) -> Json {
        match self {
            FieldValue::Null => Json::Null,
            FieldValue::Integer(v) => Json::from(*v),
            FieldValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            FieldValue::Text(v) => Json::String(v.clone()),
            FieldValue::Blob(v) => Json::Array(v.iter().map(|b| Json::from(*b)).collect()),
            FieldValue::Record(r) => r.to_json(),
        }
    }
}

impl From<rusqlite::types::Value> for FieldValue {
    fn from(value: rusqlite::types::Value) -> Self {
        use rusqlite::types::Value;
        match value {
            Value::Null => FieldValue::Null,
            Value::Integer(v) => FieldValue::Integer(v),
            Value::Real(v) => FieldValue::Real(v),
            Value::Text(v) => FieldValue::Text(v),
            Value::Blob(v) => FieldValue::Blob(v),
        }
    }
}

impl rusqlite::ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value, ValueRef};
        match self {
            FieldValue::Null => Ok(ToSqlOutput::Owned(Value::Null)),
            FieldValue::Integer(v) => Ok(ToSqlOutput::Owned(Value::Integer(*v))),
            FieldValue::Real(v) => Ok(ToSqlOutput::Owned(Value::Real(*v))),
            FieldValue::Text(v) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes()))),
            FieldValue::Blob(v) => Ok(ToSqlOutput::Borrowed(ValueRef::Blob(v))),
            FieldValue::Record(_) => Err(rusqlite::Error::ToSqlConversionFailure(Box::new(
                Error::TypeMismatch("a nested record cannot be bound as a parameter".to_string()),
            ))),
        }
    }
}

/// Coerce a raw JSON value to the given kind.
///
/// Missing (`null`) and empty values yield the kind's zero value: `0`,
/// `0.0`, the empty string or the empty blob.
pub fn coerce(raw: &Json, kind: FieldKind) -> Result<FieldValue> {
    match kind {
        FieldKind::Integer => coerce_integer(raw),
        FieldKind::Text => Ok(FieldValue::Text(coerce_text(raw))),
        FieldKind::Real => coerce_real(raw),
        FieldKind::Blob => coerce_blob(raw),
    }
}

fn coerce_integer(raw: &Json) -> Result<FieldValue> {
    let value = match raw {
        Json::Null => 0,
        Json::Bool(b) => *b as i64,
        Json::Number(n) => match n.as_i64() {
            Some(v) => v,
            None => n
                .as_f64()
                .ok_or_else(|| mismatch(FieldKind::Integer, raw))? as i64,
        },
        Json::String(s) if s.is_empty() => 0,
        // numeric strings are parsed as floating values, then truncated
        Json::String(s) => s
            .parse::<f64>()
            .map_err(|_| mismatch(FieldKind::Integer, raw))? as i64,
        _ => return Err(mismatch(FieldKind::Integer, raw)),
    };
    Ok(FieldValue::Integer(value))
}

fn coerce_text(raw: &Json) -> String {
    match raw {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        Json::Array(items) => items
            .iter()
            .map(display_string)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn display_string(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_real(raw: &Json) -> Result<FieldValue> {
    let value = match raw {
        Json::Null => 0.0,
        Json::Bool(b) => *b as i64 as f64,
        Json::Number(n) => n.as_f64().ok_or_else(|| mismatch(FieldKind::Real, raw))?,
        Json::String(s) if s.is_empty() => 0.0,
        Json::String(s) => parse_real(s)?,
        _ => return Err(mismatch(FieldKind::Real, raw)),
    };
    Ok(FieldValue::Real(value))
}

/// Parse the loose numeric notations the submission interface accepts:
/// comma decimal separators, the `½` glyph, fractions (`1/2`), ranges
/// averaged to their midpoint (`1-3`) and fraction-to-number ranges
/// (`1/2-2`).
fn parse_real(input: &str) -> Result<f64> {
    let normalized = input.replace(',', ".").replace('½', ".5");

    let value = if normalized.contains('-') && normalized.contains('/') {
        let (start, end) = split_two(&normalized, '-')?;
        let start = if start.contains('/') {
            parse_fraction(start)?
        } else {
            parse_f64(start)?
        };
        (start + parse_f64(end)?) / 2.0
    } else if normalized.contains('/') {
        parse_fraction(&normalized)?
    } else if normalized.contains('-') {
        let (start, end) = split_two(&normalized, '-')?;
        (parse_f64(start)? + parse_f64(end)?) / 2.0
    } else {
        parse_f64(&normalized)?
    };

    // division by zero and overflowing notations land here
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::TypeMismatch(format!(
            "'{input}' is not a finite number"
        )))
    }
}

fn parse_fraction(input: &str) -> Result<f64> {
    let (numerator, denominator) = split_two(input, '/')?;
    Ok(parse_f64(numerator)? / parse_f64(denominator)?)
}

fn split_two(input: &str, separator: char) -> Result<(&str, &str)> {
    input.split_once(separator).ok_or_else(|| {
        Error::TypeMismatch(format!("expected '{separator}'-separated value, got '{input}'"))
    })
}

fn parse_f64(input: &str) -> Result<f64> {
    input
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::TypeMismatch(format!("expected a numeric value, got '{input}'")))
}

fn coerce_blob(raw: &Json) -> Result<FieldValue> {
    let bytes = match raw {
        Json::Null => Vec::new(),
        Json::String(s) => s.as_bytes().to_vec(),
        Json::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .filter(|b| *b <= u8::MAX as u64)
                    .map(|b| b as u8)
                    .ok_or_else(|| mismatch(FieldKind::Blob, raw))
            })
            .collect::<Result<Vec<u8>>>()?,
        _ => return Err(mismatch(FieldKind::Blob, raw)),
    };
    Ok(FieldValue::Blob(bytes))
}

fn mismatch(kind: FieldKind, raw: &Json) -> Error {
    Error::TypeMismatch(format!("expected {}, got {raw}", kind.sql_type()))
}

/// Coerce a raw record against a model's declared fields.
///
/// Every key must be declared on the model; values are coerced per the
/// declared kind, with missing fields taking the kind's zero value.
/// Returns the coerced values for non-autoincrement fields in declaration
/// order, ready to bind against the model's insert statement.
pub fn sanitize(descriptor: &ModelDescriptor, raw: &Map<String, Json>) -> Result<Vec<FieldValue>> {
    for key in raw.keys() {
        if descriptor.field(key).is_none() {
            return Err(Error::UnknownField(
                descriptor.name().to_string(),
                key.clone(),
            ));
        }
    }

    let mut values = Vec::with_capacity(descriptor.fields().len());
    for (name, spec) in descriptor.fields() {
        if spec.auto_increment {
            continue;
        }
        let value = match raw.get(name) {
            Some(v) => coerce(v, spec.kind).map_err(|e| match e {
                Error::TypeMismatch(msg) => Error::TypeMismatch(format!("field '{name}': {msg}")),
                other => other,
            })?,
            None => coerce(&Json::Null, spec.kind)?,
        };
        values.push(value);
    }
    Ok(values)
}
