//! REST API surface (§6): route table, shared state, and the base-path /
//! static-file layer the single-page UI is served behind.

pub mod auth;
pub mod error;
pub mod tasks;
pub mod templates;

use axum::Router;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use scheduler_core::engine::Engine;
use scheduler_core::store::Store;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use auth::AuthConfig;

pub struct AppState {
    pub store: Store,
    pub engine: Arc<Engine>,
    pub auth: Option<AuthConfig>,
    pub default_account: String,
    pub base_path: String,
}

/// Builds the full router: `/api/*` behind optional Basic Auth, the UI's
/// static assets served with an `index.html` SPA fallback, and everything
/// mounted under the configured base path (§6, §10.3).
pub fn build_router(state: Arc<AppState>, config: &Config) -> Router {
    let mut api = Router::new()
        .route("/health", get(tasks::health))
        .route("/accounts", get(tasks::accounts))
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/tasks/batch", post(tasks::batch_tasks))
        .route(
            "/tasks/{id}",
            get(tasks::get_task).put(tasks::update_task).delete(tasks::delete_task),
        )
        .route("/tasks/{id}/run", post(tasks::run_task))
        .route("/tasks/{id}/toggle", post(tasks::toggle_task))
        .route(
            "/tasks/{id}/results",
            get(tasks::list_results).delete(tasks::delete_all_results),
        )
        .route("/tasks/{id}/results/{result_id}", delete(tasks::delete_one_result))
        .route("/templates/export", get(templates::export_templates))
        .route("/templates/import", post(templates::import_templates))
        .route(
            "/templates",
            get(templates::list_templates).post(templates::create_template),
        )
        .route(
            "/templates/{key}",
            put(templates::update_template).delete(templates::delete_template).get(templates::get_template),
        );

    if state.auth.is_some() {
        api = api.layer(middleware::from_fn_with_state(state.clone(), auth::basic_auth));
    }

    let mut app = Router::new().nest("/api", api);

    if config.ui_root.is_dir() {
        let index = config.ui_root.join("index.html");
        let serve_dir = ServeDir::new(&config.ui_root).fallback(ServeFile::new(index));
        app = app.fallback_service(serve_dir);
    }

    let app = app
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    if state.base_path.is_empty() {
        app
    } else {
        Router::new()
            .nest(&state.base_path, app)
            .fallback(base_path_miss)
    }
}

async fn base_path_miss(_req: Request) -> impl IntoResponse {
    StatusCode::NOT_FOUND
}
