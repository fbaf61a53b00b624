use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use scheduler_core::model::{Template, TemplateBody};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::AppState;

pub async fn list_templates(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let templates = state.store.list_templates().await?;
    Ok(Json(json!({ "data": templates })))
}

pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_template(&key).await?))
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(template): Json<Template>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.upsert_template(&template).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(mut template): Json<Template>,
) -> Result<impl IntoResponse, ApiError> {
    template.key = key;
    state.store.upsert_template(&template).await?;
    Ok(Json(template))
}

pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_template(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn export_templates(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let templates = state.store.list_templates().await?;
    let by_key: HashMap<String, TemplateBody> = templates
        .into_iter()
        .map(|t| (t.key, TemplateBody { name: t.name, body: t.body }))
        .collect();
    Ok(Json(by_key))
}

pub async fn import_templates(
    State(state): State<Arc<AppState>>,
    Json(templates): Json<HashMap<String, TemplateBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let mut imported = 0usize;
    for (key, body) in templates {
        let template = Template { key, name: body.name, body: body.body };
        state.store.upsert_template(&template).await?;
        imported += 1;
    }
    Ok(Json(json!({ "imported": imported })))
}
