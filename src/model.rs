//! Model descriptors and schema synthesis.
//!
//! A model is represented as data: a name plus an ordered list of field
//! specifications. Declaration order is significant - it drives column
//! order, insert-column order and positional parameter order. Descriptors
//! are never mutated after construction; redefining a model replaces its
//! descriptor wholesale.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::field::{self, FieldKind, FieldSpec, FieldValue};
use crate::{Error, Result};

/// A named, schema-described record type
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    name: String,
    fields: Vec<(String, FieldSpec)>,
}

impl ModelDescriptor {
    /// Build a descriptor from explicit field specs, in declaration order.
    ///
    /// Fails with a schema error on invalid identifiers, duplicate field
    /// names, or an auto-increment field that is not an Integer primary key.
    pub fn new(name: &str, fields: Vec<(String, FieldSpec)>) -> Result<Self> {
        validate_identifier(name)?;
        if name.starts_with('_') {
            return Err(Error::Schema(format!(
                "model names starting with '_' are reserved: '{name}'"
            )));
        }
        if fields.is_empty() {
            return Err(Error::Schema(format!("model '{name}' declares no fields")));
        }
        let mut seen = HashSet::new();
        for (field_name, spec) in &fields {
            validate_identifier(field_name)?;
            if !seen.insert(field_name.as_str()) {
                return Err(Error::Schema(format!(
                    "duplicate field '{field_name}' on model '{name}'"
                )));
            }
            if spec.auto_increment && !(spec.primary_key && spec.kind == FieldKind::Integer) {
                return Err(Error::Schema(format!(
                    "field '{field_name}' on model '{name}': AUTOINCREMENT requires an Integer primary key"
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            fields,
        })
    }

    /// Build a descriptor from a submitted `{field: type_name}` map.
    ///
    /// Type names matching an entry in `known_models` become Integer
    /// foreign keys to that model's `id`. Every model gets an identifier
    /// column: a declared Integer `id` field is upgraded to the
    /// auto-increment primary key, and one is prepended when none is
    /// declared, so generated row ids and foreign-key targets line up.
    pub fn from_type_names(
        name: &str,
        fields: &Map<String, Json>,
        known_models: &HashSet<String>,
    ) -> Result<Self> {
        let mut specs = Vec::with_capacity(fields.len() + 1);
        for (field_name, type_name) in fields {
            let type_name = type_name.as_str().ok_or_else(|| {
                Error::Schema(format!(
                    "field '{field_name}' on model '{name}' must declare its type as a string"
                ))
            })?;
            specs.push((
                field_name.clone(),
                field::spec_for_type_name(type_name, known_models),
            ));
        }

        match specs.iter_mut().find(|(field_name, _)| field_name == "id") {
            Some((_, spec)) if spec.kind == FieldKind::Integer && spec.foreign_key.is_none() => {
                spec.primary_key = true;
                spec.auto_increment = true;
            }
            Some(_) => {
                return Err(Error::Schema(format!(
                    "field 'id' on model '{name}' must be a plain Integer"
                )));
            }
            None => specs.insert(0, ("id".to_string(), FieldSpec::id())),
        }

        Self::new(name, specs)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared fields in declaration order
    pub fn fields(&self) -> &[(String, FieldSpec)] {
        &self.fields
    }

    /// Look up one field's spec by name
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .map(|(_, spec)| spec)
    }

    /// Synthesize the CREATE TABLE statement: one column definition per
    /// field in declaration order, then one FOREIGN KEY clause per
    /// reference field, also in declaration order.
    pub fn create_table_sql(&self) -> String {
        let mut columns = Vec::with_capacity(self.fields.len());
        let mut foreign_keys = Vec::new();
        for (name, spec) in &self.fields {
            let mut definition = format!("\"{name}\" {}", spec.kind.sql_type());
            if spec.primary_key {
                definition.push_str(" PRIMARY KEY");
                if spec.auto_increment {
                    definition.push_str(" AUTOINCREMENT");
                }
            }
            if spec.unique {
                definition.push_str(" UNIQUE");
            }
            if !spec.nullable {
                definition.push_str(" NOT NULL");
            }
            if let Some((target_model, target_field)) = &spec.foreign_key {
                foreign_keys.push(format!(
                    "FOREIGN KEY(\"{name}\") REFERENCES \"{target_model}\"(\"{target_field}\") ON DELETE CASCADE"
                ));
            }
            columns.push(definition);
        }
        columns.extend(foreign_keys);
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            self.name,
            columns.join(", ")
        )
    }

    /// Synthesize the INSERT statement covering every non-autoincrement
    /// field in declaration order, with positional placeholders.
    pub fn insert_sql(&self) -> String {
        let fields: Vec<&str> = self
            .fields
            .iter()
            .filter(|(_, spec)| !spec.auto_increment)
            .map(|(name, _)| name.as_str())
            .collect();
        let columns = fields
            .iter()
            .map(|name| format!("\"{name}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=fields.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO \"{}\" ({columns}) VALUES ({placeholders})",
            self.name
        )
    }

    /// Synthesize the SELECT statement with equality filters in the
    /// caller-supplied order.
    pub fn select_sql(&self, filters: &[String]) -> String {
        let mut sql = format!("SELECT * FROM \"{}\"", self.name);
        if !filters.is_empty() {
            let conditions = filters
                .iter()
                .enumerate()
                .map(|(i, name)| format!("\"{name}\" = ?{}", i + 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            sql.push_str(" WHERE ");
            sql.push_str(&conditions);
        }
        sql
    }
}

/// Names that end up inside SQL statements or filesystem paths are
/// restricted to `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Schema(format!("invalid identifier: '{name}'")))
    }
}

/// An instance of a model: a shared descriptor plus one typed value per
/// declared field, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    descriptor: Arc<ModelDescriptor>,
    values: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new(descriptor: Arc<ModelDescriptor>, values: Vec<(String, FieldValue)>) -> Self {
        Self { descriptor, values }
    }

    pub fn model(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// Replace one field's value, e.g. swapping a raw foreign-key id for
    /// the hydrated referenced record.
    pub fn set(&mut self, field: &str, value: FieldValue) {
        if let Some(slot) = self.values.iter_mut().find(|(name, _)| name == field) {
            slot.1 = value;
        }
    }

    /// JSON object in field declaration order
    pub fn to_json(&self) -> Json {
        let mut map = Map::with_capacity(self.values.len());
        for (name, value) in &self.values {
            map.insert(name.clone(), value.to_json());
        }
        Json::Object(map)
    }
}
