use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

use crate::server::AppState;

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub dbname: String,
    pub dbtype: String,
    /// `{model_name: {field_name: type_name}}`, in submission order
    pub db_models: Map<String, Value>,
}

#[derive(Deserialize)]
pub struct StoreRequest {
    pub dbname: String,
    pub dbtype: String,
    pub model: String,
    pub data: Map<String, Value>,
}

#[derive(Deserialize)]
pub struct BulkStoreRequest {
    pub dbname: String,
    pub dbtype: String,
    pub model: String,
    pub data: Vec<Map<String, Value>>,
}

#[derive(Deserialize)]
pub struct RetrieveRequest {
    pub dbname: String,
    pub dbtype: String,
    pub model: String,
    pub filters: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
pub struct ModelsParams {
    pub dbname: String,
    #[serde(default = "default_dbtype")]
    pub dbtype: String,
}

fn default_dbtype() -> String {
    "sqlite".to_string()
}

fn error_response(message: impl std::fmt::Display) -> Json<Value> {
    Json(json!({"status": "error", "message": message.to_string()}))
}

/// Register every model in the submitted schema, in submission order.
/// A model referencing another must be submitted after its target.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> Json<Value> {
    tracing::info!(db = %request.dbname, models = request.db_models.len(), "connect");
    for (model, fields) in &request.db_models {
        let Some(fields) = fields.as_object() else {
            return error_response(format!("model '{model}' must map field names to type names"));
        };
        if let Err(e) = state
            .dispatcher
            .create_model(&request.dbname, &request.dbtype, model, fields.clone())
            .await
        {
            tracing::error!(db = %request.dbname, model = %model, error = %e, "create_model failed");
            return error_response(e);
        }
    }
    Json(json!({"status": "success"}))
}

pub async fn store(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StoreRequest>,
) -> Json<Value> {
    match state
        .dispatcher
        .store_data(&request.dbname, &request.dbtype, &request.model, request.data)
        .await
    {
        Ok(id) => Json(json!({"status": "success", "id": id})),
        Err(e) => {
            tracing::error!(db = %request.dbname, model = %request.model, error = %e, "store failed");
            error_response(e)
        }
    }
}

/// Store each element independently; the first failure stops the batch
/// and reports it, earlier inserts stay.
pub async fn bulk_store(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkStoreRequest>,
) -> Json<Value> {
    let mut ids = Vec::with_capacity(request.data.len());
    for item in request.data {
        match state
            .dispatcher
            .store_data(&request.dbname, &request.dbtype, &request.model, item)
            .await
        {
            Ok(id) => ids.push(id),
            Err(e) => {
                tracing::error!(db = %request.dbname, model = %request.model, error = %e, "bulk store failed");
                return error_response(e);
            }
        }
    }
    Json(json!({"status": "success", "ids": ids}))
}

pub async fn retrieve(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RetrieveRequest>,
) -> Json<Value> {
    match state
        .dispatcher
        .retrieve_data(&request.dbname, &request.dbtype, &request.model, request.filters)
        .await
    {
        Ok(records) => {
            let data: Vec<Value> = records.iter().map(|r| r.to_json()).collect();
            Json(json!({"status": "success", "data": data}))
        }
        Err(e) => {
            tracing::error!(db = %request.dbname, model = %request.model, error = %e, "retrieve failed");
            error_response(e)
        }
    }
}

pub async fn models(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ModelsParams>,
) -> Json<Value> {
    match state.dispatcher.get_models(&params.dbname, &params.dbtype).await {
        Ok(names) => Json(json!({"status": "success", "models": names})),
        Err(e) => error_response(e),
    }
}
