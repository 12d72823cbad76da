use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::{
    error::{Error, Result},
    registry::ServiceRegistry,
    schema::id_to_string,
    service::RecordPatch,
};

/// The provisioning layer that knows where each service's manager runs.
#[async_trait]
pub trait ProvisioningOracle: Send + Sync {
    /// Current manager address of the service, or `None` while it has none.
    async fn resolve_manager_address(&self, service_id: u64) -> Result<Option<String>>;

    /// Asks the provisioning layer to stop the service. Returns whether the
    /// request was acknowledged.
    async fn request_termination(&self, service_id: u64, caller_id: &str) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct DirectorApp {
    aid: Value,
    #[serde(default)]
    manager: Option<String>,
}

/// Oracle backed by the director's HTTP API.
#[derive(Debug, Clone)]
pub struct DirectorOracle {
    http_client: Client,
    url: Url,
    uid: String,
    timeout: Duration,
}

fn map_director_err(action: &str) -> impl Fn(reqwest::Error) -> Error + '_ {
    move |e| Error::Transport {
        method: action.to_string(),
        reason: e.to_string(),
    }
}

impl DirectorOracle {
    pub fn new(mut director_addr: Url, uid: String, timeout: Duration) -> Self {
        if !director_addr.path().ends_with('/') {
            let path = format!("{}/", director_addr.path());
            director_addr.set_path(&path);
        }
        Self {
            http_client: Client::new(),
            url: director_addr,
            uid,
            timeout,
        }
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.url
            .join(path)
            .map_err(|e| Error::Custom(format!("invalid director path {path}: {e}")))
    }

    async fn post(&self, path: &str) -> Result<(String, reqwest::StatusCode)> {
        let resp = self
            .http_client
            .post(self.join(path)?)
            .form(&[("uid", self.uid.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_director_err(path))?;
        let status = resp.status();
        let body = resp.text().await.map_err(map_director_err(path))?;
        Ok((body, status))
    }
}

/// Truthiness of a JSON acknowledgement: `false`, `0`, `null` and empty
/// strings or collections do not count.
fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[async_trait]
impl ProvisioningOracle for DirectorOracle {
    async fn resolve_manager_address(&self, service_id: u64) -> Result<Option<String>> {
        let (body, _) = self.post("listapp").await?;
        let apps: Vec<DirectorApp> =
            serde_json::from_str(&body).map_err(|_| Error::MalformedResponse {
                method: "listapp".to_string(),
                body: body.clone(),
                idempotent: true,
            })?;
        let target = service_id.to_string();
        Ok(apps
            .into_iter()
            .find(|app| id_to_string(&app.aid).as_deref() == Some(target.as_str()))
            .and_then(|app| app.manager)
            .filter(|m| !m.is_empty()))
    }

    async fn request_termination(&self, service_id: u64, caller_id: &str) -> Result<bool> {
        tracing::debug!("user {} asks director to stop {}", caller_id, service_id);
        let (body, status) = self.post(&format!("stopapp/{service_id}")).await?;
        match serde_json::from_str::<Value>(&body) {
            Ok(ack) => Ok(status.is_success() && is_truthy(&ack)),
            Err(_) => Ok(false),
        }
    }
}

/// Result of comparing the cached manager address with the oracle's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressCheck {
    Unchanged,
    /// First resolution of a service that had no address
    Resolved(String),
    /// The manager moved or restarted elsewhere
    Changed { previous: String, current: String },
    /// The oracle has no address for the service
    Unresolved,
}

/// Cached view of where one service's manager lives.
pub struct ManagerHandle<'a> {
    oracle: &'a dyn ProvisioningOracle,
    service_id: u64,
    cached: Option<String>,
}

impl<'a> ManagerHandle<'a> {
    pub fn new(oracle: &'a dyn ProvisioningOracle, service_id: u64, cached: Option<String>) -> Self {
        Self {
            oracle,
            service_id,
            cached,
        }
    }

    pub fn cached_address(&self) -> Option<&str> {
        self.cached.as_deref()
    }

    /// Asks the oracle for the address, remembering it when there is one.
    pub async fn resolve_address(&mut self) -> Result<Option<String>> {
        let resolved = self.oracle.resolve_manager_address(self.service_id).await?;
        if let Some(address) = &resolved {
            self.cached = Some(address.clone());
        }
        Ok(resolved)
    }

    /// Re-resolves the address. When it differs from the cached one the cache
    /// and the durable record are updated before the change is reported.
    pub async fn recheck_and_maybe_update(
        &mut self,
        registry: &dyn ServiceRegistry,
    ) -> Result<AddressCheck> {
        let previous = self.cached.clone();
        let Some(current) = self.oracle.resolve_manager_address(self.service_id).await? else {
            return Ok(AddressCheck::Unresolved);
        };
        if previous.as_deref() == Some(current.as_str()) {
            return Ok(AddressCheck::Unchanged);
        }
        registry
            .save(
                self.service_id,
                RecordPatch {
                    manager_address: Some(Some(current.clone())),
                    ..Default::default()
                },
            )
            .await?;
        self.cached = Some(current.clone());
        Ok(match previous {
            None => AddressCheck::Resolved(current),
            Some(previous) => {
                tracing::info!(
                    "service {} manager moved from {} to {}",
                    self.service_id,
                    previous,
                    current
                );
                AddressCheck::Changed { previous, current }
            }
        })
    }

    /// Requests a stop from the provisioning layer. Anything but a truthy
    /// acknowledgement is an error and the service must be assumed alive.
    pub async fn terminate(&self, caller_id: &str) -> Result<()> {
        if self
            .oracle
            .request_termination(self.service_id, caller_id)
            .await?
        {
            Ok(())
        } else {
            Err(Error::Termination(format!(
                "provisioning layer did not acknowledge stopping service {}",
                self.service_id
            )))
        }
    }
}
