use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use scheduler::api::{self, AppState};
use scheduler::config::Config;
use scheduler_core::engine::{Engine, EngineConfig};
use scheduler_core::store::Store;
use serde_json::{Value, json};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_config() -> Config {
    Config {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        db_path: String::new(),
        ui_root: "/no/such/ui/root".into(),
        base_path: String::new(),
        enable_ssl: false,
        cert_path: None,
        key_path: None,
        enable_ipv6: false,
        auth_config_path: None,
        default_account: scheduler_core::account::current_account_name()
            .unwrap_or_else(|_| "root".to_owned()),
        task_timeout: Duration::from_secs(5),
        condition_timeout: Duration::from_secs(5),
        openssl_bin: "openssl".to_owned(),
        self_signed_days: 825,
        self_signed_subject: "/CN=localhost".to_owned(),
    }
}

async fn test_app() -> axum::Router {
    let config = test_config();
    let store = Store::open_in_memory().await.unwrap();
    let engine = Engine::new(store.clone(), EngineConfig::default());
    let state = Arc::new(AppState {
        store,
        engine,
        auth: None,
        default_account: config.default_account.clone(),
        base_path: config.base_path.clone(),
    });
    api::build_router(state, &config)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_task_count() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["task_count"], 0);
}

#[tokio::test]
async fn create_then_list_round_trips() {
    let app = test_app().await;
    let account = scheduler_core::account::current_account_name().unwrap_or_else(|_| "root".to_owned());
    let payload = json!({
        "name": "nightly-backup",
        "account": account,
        "trigger_type": "schedule",
        "schedule_expression": "0 2 * * *",
        "script_body": "echo backing up",
    });
    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tasks")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::CREATED);
    let created = body_json(create).await;
    assert_eq!(created["name"], "nightly-backup");

    let list = app
        .oneshot(Request::builder().uri("/api/tasks").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(list.status(), StatusCode::OK);
    let body = body_json(list).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["latest_result"], Value::Null);
}

#[tokio::test]
async fn unknown_task_is_404() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/api/tasks/999").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn accounts_endpoint_lists_current_account() {
    let app = test_app().await;
    let account = scheduler_core::account::current_account_name().unwrap_or_else(|_| "root".to_owned());
    let response = app
        .oneshot(Request::builder().uri("/api/accounts").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let data = body["data"].as_array().unwrap();
    assert!(data.iter().any(|v| v == &json!(account)));
}

#[tokio::test]
async fn templates_export_import_round_trips_as_keyed_object() {
    let app = test_app().await;
    let payload = json!({ "key": "greet", "name": "Greeting", "body": "echo hi" });
    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/templates")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::CREATED);

    let export = app
        .clone()
        .oneshot(Request::builder().uri("/api/templates/export").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(export.status(), StatusCode::OK);
    let exported = body_json(export).await;
    assert_eq!(exported["greet"]["name"], "Greeting");
    assert_eq!(exported["greet"]["body"], "echo hi");
    assert!(exported.get("key").is_none());

    let import_payload = json!({ "onboarding": { "name": "Onboarding", "body": "echo welcome" } });
    let import = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/templates/import")
                .header("content-type", "application/json")
                .body(Body::from(import_payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(import.status(), StatusCode::OK);
    let result = body_json(import).await;
    assert_eq!(result["imported"], 1);
}

#[tokio::test]
async fn batch_reports_missing_ids() {
    let app = test_app().await;
    let payload = json!({ "action": "delete", "task_ids": [42] });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tasks/batch")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["missing"], json!([42]));
}
