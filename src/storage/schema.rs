//! Schema metadata persistence.
//!
//! Every database carries a `_models` table mapping model names to the
//! JSON-encoded `{field: type_name}` map they were submitted with, so the
//! in-memory registry can be rebuilt after a process restart without
//! resubmitting the schema.

use serde_json::{Map, Value as Json};

use crate::{Error, Result};

/// SQL to create the model metadata table
pub const CREATE_MODELS_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS _models (name TEXT PRIMARY KEY, fields TEXT NOT NULL)";

/// Upsert one model's field map
pub const UPSERT_MODEL: &str = "INSERT OR REPLACE INTO _models (name, fields) VALUES (?1, ?2)";

/// Fetch one model's persisted field map
pub const SELECT_MODEL_FIELDS: &str = "SELECT fields FROM _models WHERE name = ?1";

/// List every persisted model name
pub const SELECT_MODEL_NAMES: &str = "SELECT name FROM _models";

/// Encode a submitted field map for the metadata table, preserving
/// declaration order.
pub fn encode_fields(fields: &Map<String, Json>) -> Result<String> {
    serde_json::to_string(fields).map_err(Error::from)
}

/// Decode a persisted field map back into declaration order
pub fn decode_fields(raw: &str) -> Result<Map<String, Json>> {
    let value: Json = serde_json::from_str(raw)?;
    match value {
        Json::Object(map) => Ok(map),
        other => Err(Error::Schema(format!(
            "persisted field spec is not an object: {other}"
        ))),
    }
}
