#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use netconpaas::{
    error::Result,
    frontend::{Frontend, Settings},
    manager::ProvisioningOracle,
    poll::PollConfig,
    registry::MemoryRegistry,
    rpc::RpcClient,
    service::Timeouts,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};

/// A manager that answers every method with a canned envelope.
#[derive(Clone, Default)]
pub struct FakeManager {
    replies: Arc<Mutex<HashMap<String, Value>>>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    delays: Arc<Mutex<HashMap<String, Duration>>>,
}

impl FakeManager {
    pub fn reply(&self, method: &str, envelope: Value) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), envelope);
    }

    /// Holds every reply to `method` back for `delay`.
    pub fn delay(&self, method: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(method.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn params_of(&self, method: &str) -> Option<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
    }

    async fn answer(&self, method: String, params: Value) -> Json<Value> {
        let delay = self.delays.lock().unwrap().get(&method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&method)
            .cloned()
            .unwrap_or_else(|| json!({"error": format!("unknown method {method}")}));
        self.calls.lock().unwrap().push((method, params));
        Json(reply)
    }
}

async fn rpc_get(
    State(fake): State<FakeManager>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let method = query.get("method").cloned().unwrap_or_default();
    let params = query
        .get("params")
        .and_then(|p| serde_json::from_str(p).ok())
        .unwrap_or(Value::Null);
    fake.answer(method, params).await
}

async fn rpc_post(State(fake): State<FakeManager>, Json(body): Json<Value>) -> Json<Value> {
    let method = body["method"].as_str().unwrap_or_default().to_string();
    fake.answer(method, body["params"].clone()).await
}

pub struct Server {
    pub address: String,
    handle: JoinHandle<()>,
}

impl Server {
    /// Drops the listener so the address becomes unreachable.
    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub async fn serve(router: Router) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Server { address, handle }
}

pub async fn spawn_manager(fake: FakeManager) -> Server {
    let router = Router::new()
        .route("/", get(rpc_get).post(rpc_post))
        .with_state(fake);
    serve(router).await
}

/// Oracle whose answers the test controls directly.
#[derive(Default)]
pub struct FakeOracle {
    pub address: Mutex<Option<String>>,
    pub terminations: Mutex<Vec<u64>>,
}

impl FakeOracle {
    pub fn set_address(&self, address: Option<&str>) {
        *self.address.lock().unwrap() = address.map(str::to_string);
    }
}

#[async_trait]
impl ProvisioningOracle for FakeOracle {
    async fn resolve_manager_address(&self, _service_id: u64) -> Result<Option<String>> {
        Ok(self.address.lock().unwrap().clone())
    }

    async fn request_termination(&self, service_id: u64, _caller_id: &str) -> Result<bool> {
        self.terminations.lock().unwrap().push(service_id);
        Ok(true)
    }
}

pub struct Harness {
    pub frontend: Frontend,
    pub oracle: Arc<FakeOracle>,
    pub registry: Arc<MemoryRegistry>,
}

pub fn harness() -> Harness {
    let oracle = Arc::new(FakeOracle::default());
    let registry = Arc::new(MemoryRegistry::new());
    let settings = Settings {
        timeouts: Timeouts {
            status: Duration::from_secs(5),
            action: Duration::from_secs(5),
        },
        stop_timeout: Duration::from_secs(60),
        poll: PollConfig {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(40),
            multiplier: 2.0,
            max_consecutive_failures: 3,
        },
    };
    // No pooled connections, so a stopped fake manager is unreachable at once
    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap();
    let frontend = Frontend::new(
        RpcClient::with_client(http_client),
        oracle.clone(),
        registry.clone(),
        settings,
    );
    Harness {
        frontend,
        oracle,
        registry,
    }
}

/// Replies of a healthy generic manager with one master and two nodes.
pub fn running_generic_manager() -> FakeManager {
    let fake = FakeManager::default();
    fake.reply(
        "get_service_info",
        json!({"result": {"state": "RUNNING", "type": "generic"}, "error": null}),
    );
    fake.reply(
        "list_nodes",
        json!({"result": {"master": [1], "node": [2, 3]}, "error": null}),
    );
    fake.reply(
        "get_node_info",
        json!({"result": {"serviceNode": {"id": 1, "ip": "10.0.0.1", "cloud": "default"}}}),
    );
    fake.reply(
        "get_script_status",
        json!({"result": {"agents": {"1": {"run.sh": "RUNNING"}}}}),
    );
    fake.reply(
        "list_code_versions",
        json!({"result": {"codeVersions": [
            {"codeVersionId": "code-default", "filename": "code-default.tar", "description": "Initial version", "current": true},
            {"codeVersionId": "code-2", "filename": "app.tar", "description": "second"}
        ]}}),
    );
    fake
}
