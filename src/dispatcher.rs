//! The operation dispatcher.
//!
//! Keeps a process-wide cache of storage engines keyed by database name
//! and routes every high-level operation through a bounded worker budget:
//! the blocking engine call runs on the tokio blocking pool under a
//! semaphore permit while the caller suspends. There is no cross-operation
//! ordering guarantee - a caller that needs `create_model` to precede a
//! dependent `store_data` must await the first before issuing the second.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{Map, Value as Json};
use tokio::sync::{Mutex, Semaphore};

use crate::model::Record;
use crate::storage::StorageEngine;
use crate::{Error, Result};

/// The only backend type currently supported
const SQLITE: &str = "sqlite";

type SharedEngine = Arc<StdMutex<StorageEngine>>;

pub struct Dispatcher {
    storage_dir: PathBuf,
    engines: Mutex<HashMap<String, SharedEngine>>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    accepting: AtomicBool,
}

impl Dispatcher {
    /// A dispatcher whose workers never exceed `max_workers` concurrent
    /// blocking storage calls.
    pub fn new(storage_dir: impl Into<PathBuf>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            storage_dir: storage_dir.into(),
            engines: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            accepting: AtomicBool::new(true),
        }
    }

    /// Look up or lazily build the engine for a database. The cache lock
    /// guards the whole check-then-create sequence, so two racing first
    /// requests for the same name produce one engine.
    async fn engine(&self, dbname: &str, dbtype: &str) -> Result<SharedEngine> {
        if dbtype != SQLITE {
            return Err(Error::Connection(format!(
                "unsupported database type: {dbtype}"
            )));
        }
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(dbname) {
            return Ok(engine.clone());
        }

        let storage_dir = self.storage_dir.clone();
        let name = dbname.to_string();
        let engine = tokio::task::spawn_blocking(move || StorageEngine::open(&storage_dir, &name))
            .await
            .map_err(join_error)??;
        let engine = Arc::new(StdMutex::new(engine));
        engines.insert(dbname.to_string(), engine.clone());
        tracing::info!(db = dbname, "storage engine opened");
        Ok(engine)
    }

    /// Run one blocking engine operation on the worker pool, suspending
    /// the caller until it completes.
    async fn execute<T, F>(&self, dbname: &str, dbtype: &str, operation: F) -> Result<T>
    where
        F: FnOnce(&mut StorageEngine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(shut_down());
        }
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| shut_down())?;

        let engine = self.engine(dbname, dbtype).await?;
        tokio::task::spawn_blocking(move || {
            let mut engine = engine
                .lock()
                .map_err(|_| Error::Connection("storage engine lock poisoned".to_string()))?;
            operation(&mut engine)
        })
        .await
        .map_err(join_error)?
    }

    pub async fn create_model(
        &self,
        dbname: &str,
        dbtype: &str,
        model: &str,
        fields: Map<String, Json>,
    ) -> Result<()> {
        let model = model.to_string();
        self.execute(dbname, dbtype, move |engine| {
            engine.create_model(&model, &fields).map(|_| ())
        })
        .await
    }

    pub async fn store_data(
        &self,
        dbname: &str,
        dbtype: &str,
        model: &str,
        data: Map<String, Json>,
    ) -> Result<i64> {
        let model = model.to_string();
        self.execute(dbname, dbtype, move |engine| {
            engine.store_data(&model, &data)
        })
        .await
    }

    pub async fn retrieve_data(
        &self,
        dbname: &str,
        dbtype: &str,
        model: &str,
        filters: Option<Map<String, Json>>,
    ) -> Result<Vec<Record>> {
        let model = model.to_string();
        self.execute(dbname, dbtype, move |engine| {
            engine.retrieve_data(&model, filters.as_ref())
        })
        .await
    }

    pub async fn get_models(&self, dbname: &str, dbtype: &str) -> Result<Vec<String>> {
        self.execute(dbname, dbtype, |engine| engine.get_models())
            .await
    }

    /// Stop accepting work, wait for in-flight operations to finish, then
    /// close every cached engine. Idempotent.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            // draining every permit means every in-flight worker finished
            if let Ok(all) = self.workers.acquire_many(self.max_workers as u32).await {
                all.forget();
            }
            self.workers.close();
        }

        let engines = std::mem::take(&mut *self.engines.lock().await);
        for (name, engine) in engines {
            let closed = tokio::task::spawn_blocking(move || match engine.lock() {
                Ok(mut engine) => engine.close(),
                Err(_) => Err(Error::Connection(
                    "storage engine lock poisoned".to_string(),
                )),
            })
            .await
            .map_err(join_error);
            match closed {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => {
                    tracing::error!(db = %name, error = %e, "failed to close storage engine");
                }
            }
        }
        tracing::info!("dispatcher shut down");
    }
}

fn shut_down() -> Error {
    Error::Connection("dispatcher is shut down".to_string())
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Connection(format!("worker task failed: {e}"))
}
