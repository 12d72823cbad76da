mod common;

use std::{collections::HashMap, time::Duration};

use axum::{extract::Path, routing::post, Form, Json, Router};
use common::serve;
use netconpaas::{error::Error, manager::DirectorOracle, manager::ProvisioningOracle};
use serde_json::{json, Value};
use url::Url;

async fn listapp(Form(form): Form<HashMap<String, String>>) -> Json<Value> {
    if form.get("uid").map(String::as_str) != Some("alice") {
        return Json(json!([]));
    }
    Json(json!([
        {"aid": 1, "name": "web", "manager": "10.0.0.5"},
        {"aid": "2", "name": "farm", "manager": ""},
        {"aid": 3, "name": "grid", "manager": null}
    ]))
}

async fn stopapp(Path(id): Path<u64>) -> Json<Value> {
    match id {
        1 => Json(json!(true)),
        2 => Json(json!(false)),
        _ => Json(json!({})),
    }
}

async fn director() -> (common::Server, DirectorOracle) {
    let router = Router::new()
        .route("/listapp", post(listapp))
        .route("/stopapp/{id}", post(stopapp));
    let server = serve(router).await;
    let url = Url::parse(&server.address).unwrap();
    let oracle = DirectorOracle::new(url, "alice".to_string(), Duration::from_secs(5));
    (server, oracle)
}

#[tokio::test]
async fn test_director_resolves_manager_address() {
    let (_server, oracle) = director().await;
    assert_eq!(
        oracle.resolve_manager_address(1).await.unwrap().as_deref(),
        Some("10.0.0.5")
    );
    // Listed but not provisioned yet
    assert_eq!(oracle.resolve_manager_address(2).await.unwrap(), None);
    assert_eq!(oracle.resolve_manager_address(3).await.unwrap(), None);
    // Not listed at all
    assert_eq!(oracle.resolve_manager_address(42).await.unwrap(), None);
}

#[tokio::test]
async fn test_director_termination_ack() {
    let (_server, oracle) = director().await;
    assert!(oracle.request_termination(1, "alice").await.unwrap());
    assert!(!oracle.request_termination(2, "alice").await.unwrap());
    assert!(!oracle.request_termination(3, "alice").await.unwrap());
}

#[tokio::test]
async fn test_director_garbage_is_malformed() {
    let router = Router::new().route("/listapp", post(|| async { "<html>maintenance</html>" }));
    let server = serve(router).await;
    let oracle = DirectorOracle::new(
        Url::parse(&server.address).unwrap(),
        "alice".to_string(),
        Duration::from_secs(5),
    );
    assert!(matches!(
        oracle.resolve_manager_address(1).await,
        Err(Error::MalformedResponse { .. })
    ));
}

#[tokio::test]
async fn test_director_unreachable_is_transport_error() {
    let (server, oracle) = director().await;
    server.shutdown().await;
    let err = oracle.resolve_manager_address(1).await.unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));
    assert!(err.is_retryable());
}
