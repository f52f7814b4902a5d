//! The per-database storage engine.
//!
//! One engine exclusively owns one SQLite connection and one schema
//! registry for a single database name. All operations are synchronous and
//! blocking; the dispatcher runs them on a worker pool.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::{Map, Value as Json};

use super::schema;
use crate::field::{self, FieldValue};
use crate::model::{ModelDescriptor, Record};
use crate::{Error, Result};

/// Storage engine for one logical database.
///
/// The single shared connection is the chosen strategy here: every
/// operation against one database funnels through it, and SQLite's own
/// locking determines interleaving. [`super::ConnectionPool`] is the
/// pooled alternative for callers that want parallel readers.
pub struct StorageEngine {
    db_name: String,
    conn: Option<Connection>,
    registry: HashMap<String, Arc<ModelDescriptor>>,
}

impl StorageEngine {
    /// Open (creating if needed) the database file `<db_name>.db` under
    /// `storage_dir`.
    pub fn open(storage_dir: &Path, db_name: &str) -> Result<Self> {
        let db_name = db_name.strip_suffix(".db").unwrap_or(db_name);
        // the name comes from the external boundary and becomes a file
        // name; keep it from escaping the storage directory
        crate::model::validate_identifier(db_name)
            .map_err(|_| Error::Connection(format!("invalid database name: '{db_name}'")))?;
        std::fs::create_dir_all(storage_dir)?;
        let path = storage_dir.join(format!("{db_name}.db"));
        let conn = Connection::open(path)?;
        Self::initialize(db_name, conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory(db_name: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(db_name, conn)
    }

    fn initialize(db_name: &str, conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute(schema::CREATE_MODELS_TABLE, [])?;
        tracing::debug!(db = db_name, "storage engine initialized");
        Ok(Self {
            db_name: db_name.to_string(),
            conn: Some(conn),
            registry: HashMap::new(),
        })
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Connection(format!("database '{}' is closed", self.db_name)))
    }

    /// Register a model: build (or replace) its descriptor, persist the
    /// submitted field map to `_models`, and create the backing table.
    ///
    /// Idempotent for a repeated identical submission. Redefining a model
    /// replaces the descriptor wholesale but leaves the existing table
    /// untouched (`IF NOT EXISTS`), so a changed field spec silently
    /// diverges from what the table actually contains.
    pub fn create_model(
        &mut self,
        name: &str,
        fields: &Map<String, Json>,
    ) -> Result<Arc<ModelDescriptor>> {
        // a model's own name is never a reference target, also when the
        // model is already persisted and being redefined
        let mut known = self.known_models()?;
        known.remove(name);
        let descriptor = Arc::new(ModelDescriptor::from_type_names(name, fields, &known)?);

        let encoded = schema::encode_fields(fields)?;
        let conn = self.conn()?;
        conn.execute(schema::UPSERT_MODEL, params![name, encoded])?;
        conn.execute(&descriptor.create_table_sql(), [])?;

        self.registry.insert(name.to_string(), descriptor.clone());
        tracing::info!(db = %self.db_name, model = name, "model registered");
        Ok(descriptor)
    }

    /// Model names from the persisted `_models` table, independent of the
    /// in-memory registry.
    pub fn get_models(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(schema::SELECT_MODEL_NAMES)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn known_models(&self) -> Result<HashSet<String>> {
        Ok(self.get_models()?.into_iter().collect())
    }

    /// Resolve a descriptor: registry first, then lazy reload from the
    /// metadata table, then UnknownModel.
    fn descriptor(&mut self, model: &str) -> Result<Arc<ModelDescriptor>> {
        if let Some(descriptor) = self.registry.get(model) {
            return Ok(descriptor.clone());
        }

        let persisted: Option<String> = self
            .conn()?
            .query_row(schema::SELECT_MODEL_FIELDS, params![model], |row| {
                row.get(0)
            })
            .optional()?;
        let raw = persisted.ok_or_else(|| Error::UnknownModel(model.to_string()))?;

        let fields = schema::decode_fields(&raw)?;
        // the model itself is persisted by now; drop it from the reference
        // candidates so reload builds the same descriptor create_model did
        let mut known = self.known_models()?;
        known.remove(model);
        let descriptor = Arc::new(ModelDescriptor::from_type_names(model, &fields, &known)?);

        tracing::debug!(db = %self.db_name, model, "descriptor reloaded from metadata");
        self.registry.insert(model.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    /// Store one record, returning the generated row id.
    ///
    /// A field whose supplied value is itself a mapping is stored first
    /// against the field's foreign-key target model, and the returned id
    /// is substituted for the value. Nested inserts are independent
    /// statements, not one transaction: if the parent insert fails after
    /// children succeeded, the child rows remain.
    pub fn store_data(&mut self, model: &str, data: &Map<String, Json>) -> Result<i64> {
        let descriptor = self.descriptor(model)?;

        let mut flat = data.clone();
        for (key, value) in data {
            let Json::Object(nested) = value else {
                continue;
            };
            let spec = descriptor
                .field(key)
                .ok_or_else(|| Error::UnknownField(model.to_string(), key.clone()))?;
            let Some((target_model, _)) = spec.foreign_key.clone() else {
                return Err(Error::TypeMismatch(format!(
                    "field '{key}' is not a reference and cannot take a nested record"
                )));
            };
            let child_id = self.store_data(&target_model, nested)?;
            flat.insert(key.clone(), Json::from(child_id));
        }

        let values = field::sanitize(&descriptor, &flat)?;
        let conn = self.conn()?;
        conn.execute(&descriptor.insert_sql(), params_from_iter(values.iter()))?;
        let id = conn.last_insert_rowid();
        tracing::debug!(db = %self.db_name, model, id, "record stored");
        Ok(id)
    }

    /// Retrieve records matching the equality filters (all records when
    /// no filters are given), with foreign-key fields expanded into the
    /// hydrated referenced records.
    ///
    /// Expansion recurses per foreign key with no depth limit and no
    /// cycle detection: a self-referential or mutually-referential schema
    /// will recurse without bound.
    pub fn retrieve_data(
        &mut self,
        model: &str,
        filters: Option<&Map<String, Json>>,
    ) -> Result<Vec<Record>> {
        let descriptor = self.descriptor(model)?;

        let mut keys = Vec::new();
        let mut bound = Vec::new();
        if let Some(filters) = filters {
            for (key, value) in filters {
                let spec = descriptor
                    .field(key)
                    .ok_or_else(|| Error::UnknownField(model.to_string(), key.clone()))?;
                keys.push(key.clone());
                bound.push(field::coerce(value, spec.kind)?);
            }
        }

        let sql = descriptor.select_sql(&keys);
        let mut records = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(bound.iter()), |row| {
                let mut values = Vec::with_capacity(descriptor.fields().len());
                for (i, (name, _)) in descriptor.fields().iter().enumerate() {
                    let value: rusqlite::types::Value = row.get(i)?;
                    values.push((name.clone(), FieldValue::from(value)));
                }
                Ok(values)
            })?;
            let mut records = Vec::new();
            for values in rows {
                records.push(Record::new(descriptor.clone(), values?));
            }
            records
        };

        for record in &mut records {
            self.expand_references(&descriptor, record)?;
        }
        Ok(records)
    }

    /// Replace each raw foreign-key id with the referenced record, when
    /// the referenced row exists.
    fn expand_references(
        &mut self,
        descriptor: &ModelDescriptor,
        record: &mut Record,
    ) -> Result<()> {
        for (name, spec) in descriptor.fields() {
            let Some((target_model, target_field)) = &spec.foreign_key else {
                continue;
            };
            let Some(FieldValue::Integer(id)) = record.get(name) else {
                continue;
            };
            let mut filter = Map::new();
            filter.insert(target_field.clone(), Json::from(*id));
            let mut related = self.retrieve_data(target_model, Some(&filter))?;
            if !related.is_empty() {
                record.set(name, FieldValue::Record(Box::new(related.remove(0))));
            }
        }
        Ok(())
    }

    /// Release the connection. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| Error::Storage(e))?;
            tracing::info!(db = %self.db_name, "storage engine closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(raw: Json) -> Map<String, Json> {
        raw.as_object().cloned().unwrap()
    }

    fn person_engine() -> StorageEngine {
        let mut engine = StorageEngine::open_in_memory("test").unwrap();
        engine
            .create_model(
                "Person",
                &fields(json!({"name": "String", "age": "Integer", "height": "Float"})),
            )
            .unwrap();
        engine
    }

    #[test]
    fn round_trip() {
        let mut engine = person_engine();
        let id = engine
            .store_data(
                "Person",
                &fields(json!({"name": "Alice", "age": "30", "height": "1/2-2"})),
            )
            .unwrap();

        let records = engine.retrieve_data("Person", None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("id"), Some(&FieldValue::Integer(id)));
        assert_eq!(
            records[0].get("name"),
            Some(&FieldValue::Text("Alice".to_string()))
        );
        assert_eq!(records[0].get("age"), Some(&FieldValue::Integer(30)));
        assert_eq!(records[0].get("height"), Some(&FieldValue::Real(1.25)));
    }

    #[test]
    fn create_model_is_idempotent() {
        let mut engine = person_engine();
        engine
            .store_data("Person", &fields(json!({"name": "Alice", "age": 30})))
            .unwrap();

        // same name, same fields: no error, data preserved
        engine
            .create_model(
                "Person",
                &fields(json!({"name": "String", "age": "Integer", "height": "Float"})),
            )
            .unwrap();
        assert_eq!(engine.retrieve_data("Person", None).unwrap().len(), 1);
    }

    #[test]
    fn equality_filters() {
        let mut engine = person_engine();
        for (name, age) in [("Alice", 30), ("Bob", 25), ("Charlie", 25)] {
            engine
                .store_data("Person", &fields(json!({"name": name, "age": age})))
                .unwrap();
        }

        let matched = engine
            .retrieve_data("Person", Some(&fields(json!({"age": 25}))))
            .unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(
            matched[0].get("name"),
            Some(&FieldValue::Text("Bob".to_string()))
        );
        assert_eq!(
            matched[1].get("name"),
            Some(&FieldValue::Text("Charlie".to_string()))
        );

        let filtered = engine
            .retrieve_data(
                "Person",
                Some(&fields(json!({"age": 25, "name": "Charlie"}))),
            )
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn unknown_model_and_field_errors() {
        let mut engine = person_engine();
        assert!(matches!(
            engine.store_data("Ghost", &fields(json!({"a": 1}))),
            Err(Error::UnknownModel(_))
        ));
        assert!(matches!(
            engine.store_data("Person", &fields(json!({"nickname": "Al"}))),
            Err(Error::UnknownField(_, _))
        ));
        assert!(matches!(
            engine.retrieve_data("Person", Some(&fields(json!({"nickname": "Al"})))),
            Err(Error::UnknownField(_, _))
        ));
    }

    #[test]
    fn nested_write_and_read_expansion() {
        let mut engine = StorageEngine::open_in_memory("test").unwrap();
        engine
            .create_model(
                "Address",
                &fields(json!({"street": "String", "city": "String"})),
            )
            .unwrap();
        engine
            .create_model(
                "Person",
                &fields(json!({"name": "String", "address": "Address"})),
            )
            .unwrap();

        let person_id = engine
            .store_data(
                "Person",
                &fields(json!({
                    "name": "Alice",
                    "address": {"street": "Main St 1", "city": "Springfield"}
                })),
            )
            .unwrap();
        assert!(person_id > 0);

        // the nested record is independently retrievable
        let addresses = engine.retrieve_data("Address", None).unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(
            addresses[0].get("city"),
            Some(&FieldValue::Text("Springfield".to_string()))
        );

        // read expansion hydrates the reference instead of the raw id
        let people = engine.retrieve_data("Person", None).unwrap();
        assert_eq!(people.len(), 1);
        match people[0].get("address") {
            Some(FieldValue::Record(address)) => {
                assert_eq!(address.model(), "Address");
                assert_eq!(
                    address.get("street"),
                    Some(&FieldValue::Text("Main St 1".to_string()))
                );
            }
            other => panic!("expected expanded record, got {other:?}"),
        }
    }

    #[test]
    fn nested_value_for_plain_field_is_rejected() {
        let mut engine = person_engine();
        let result = engine.store_data("Person", &fields(json!({"name": {"first": "A"}})));
        assert!(matches!(result, Err(Error::TypeMismatch(_))));
    }

    #[test]
    fn models_survive_restart() {
        let dir = tempfile::tempdir().unwrap();

        let mut engine = StorageEngine::open(dir.path(), "durable").unwrap();
        engine
            .create_model("Person", &fields(json!({"name": "String"})))
            .unwrap();
        engine
            .create_model("Address", &fields(json!({"city": "String"})))
            .unwrap();
        engine
            .store_data("Person", &fields(json!({"name": "Alice"})))
            .unwrap();
        let before = engine.get_models().unwrap();
        engine.close().unwrap();

        // new engine, same backing file, cold registry
        let mut engine = StorageEngine::open(dir.path(), "durable").unwrap();
        assert_eq!(engine.get_models().unwrap(), before);

        // descriptors reload lazily from the metadata table
        let records = engine.retrieve_data("Person", None).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn redefinition_with_self_typed_field_matches_reload() {
        let dir = tempfile::tempdir().unwrap();

        let mut engine = StorageEngine::open(dir.path(), "graph").unwrap();
        engine
            .create_model("Node", &fields(json!({"name": "String"})))
            .unwrap();

        // redefine while "Node" is already persisted; its own name must
        // still map to Text, not to a self-reference
        let redefined = engine
            .create_model(
                "Node",
                &fields(json!({"name": "String", "parent": "Node"})),
            )
            .unwrap();
        let parent = redefined.field("parent").unwrap();
        assert_eq!(parent.kind, crate::field::FieldKind::Text);
        assert_eq!(parent.foreign_key, None);
        engine.close().unwrap();

        // the lazy reload path must build the same descriptor
        let mut engine = StorageEngine::open(dir.path(), "graph").unwrap();
        let reloaded = engine.descriptor("Node").unwrap();
        assert_eq!(*reloaded, *redefined);
    }

    #[test]
    fn rejects_database_names_that_escape_the_storage_dir() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["../evil", "../../tmp/evil", "a/b", "a.b"] {
            assert!(matches!(
                StorageEngine::open(dir.path(), name),
                Err(Error::Connection(_))
            ));
        }
        assert!(dir.path().read_dir().unwrap().next().is_none());
    }

    #[test]
    fn close_is_idempotent_and_operations_fail_after() {
        let mut engine = person_engine();
        engine.close().unwrap();
        engine.close().unwrap();
        assert!(matches!(
            engine.retrieve_data("Person", None),
            Err(Error::Connection(_))
        ));
    }
}
