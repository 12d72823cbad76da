use std::time::Duration;

use reqwest::{multipart, Client};
use serde_json::{Map, Value};
use url::Url;

use crate::{
    entity::state::HttpMethod,
    error::RpcError,
    schema::RpcRequest,
    service::variant::RpcMethod,
};

const REQUEST_ID: &str = "1";

/// Where a service's manager listens and which service it should act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: Url,
    pub service_id: u64,
}

impl Endpoint {
    pub fn new(url: Url, service_id: u64) -> Self {
        Self { url, service_id }
    }
}

/// A file sent along with a multipart RPC.
#[derive(Debug, Clone)]
pub struct Upload {
    pub field: &'static str,
    pub file_name: String,
    pub content: Vec<u8>,
}

/// JSON-RPC client for manager processes. It never retries: some calls are
/// not idempotent, so the caller decides.
#[derive(Debug, Clone, Default)]
pub struct RpcClient {
    http_client: Client,
}

pub(crate) fn map_reqwest_err(e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Unreachable(format!("timed out: {e}"))
    } else if e.is_connect() {
        RpcError::Unreachable(format!("connection failed: {e}"))
    } else {
        RpcError::Unreachable(e.to_string())
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http_client: Client) -> Self {
        Self { http_client }
    }

    /// Issues one call and decodes the envelope. With `expect_result` unset a
    /// missing `result` field yields `Value::Null` instead of an error.
    pub async fn call(
        &self,
        endpoint: &Endpoint,
        method: &RpcMethod,
        params: &Value,
        expect_result: bool,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        tracing::debug!(
            "{} {} on {} for service {}",
            method.http,
            method.name,
            endpoint.url,
            endpoint.service_id
        );
        let req = match method.http {
            HttpMethod::Post => {
                let body = RpcRequest {
                    service_id: endpoint.service_id,
                    method: method.name,
                    params,
                    id: REQUEST_ID,
                };
                self.http_client.post(endpoint.url.clone()).json(&body)
            }
            HttpMethod::Get => {
                let encoded_params = params.to_string();
                let service_id = endpoint.service_id.to_string();
                self.http_client.get(endpoint.url.clone()).query(&[
                    ("service_id", service_id.as_str()),
                    ("method", method.name),
                    ("id", REQUEST_ID),
                    ("params", encoded_params.as_str()),
                ])
            }
        };
        let resp = req.timeout(timeout).send().await.map_err(map_reqwest_err)?;
        let status = resp.status();
        let body = resp.text().await.map_err(map_reqwest_err)?;
        decode_envelope(status, body, expect_result)
    }

    /// Sends a multipart request carrying `fields` and one file part.
    pub async fn upload(
        &self,
        endpoint: &Endpoint,
        method: &RpcMethod,
        fields: Vec<(&'static str, String)>,
        upload: Upload,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        tracing::debug!(
            "multipart {} on {} with {} ({} bytes)",
            method.name,
            endpoint.url,
            upload.file_name,
            upload.content.len()
        );
        let mut form = multipart::Form::new()
            .text("method", method.name)
            .text("service_id", endpoint.service_id.to_string());
        for (name, value) in fields {
            form = form.text(name, value);
        }
        let part = multipart::Part::bytes(upload.content).file_name(upload.file_name);
        form = form.part(upload.field, part);
        let resp = self
            .http_client
            .post(endpoint.url.clone())
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let status = resp.status();
        let body = resp.text().await.map_err(map_reqwest_err)?;
        decode_envelope(status, body, true)
    }
}

/// Turns the `error` member into one textual message. Managers send either a
/// bare string or an object with `message` and optionally `code`.
fn normalize_remote_error(error: Value) -> RpcError {
    match error {
        Value::String(message) => RpcError::Remote {
            code: None,
            message,
        },
        Value::Object(mut obj) => {
            let code = obj.get("code").and_then(Value::as_i64);
            let message = match obj.remove("message") {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => Value::Object(obj).to_string(),
            };
            RpcError::Remote { code, message }
        }
        other => RpcError::Remote {
            code: None,
            message: other.to_string(),
        },
    }
}

pub(crate) fn decode_envelope(
    status: reqwest::StatusCode,
    body: String,
    expect_result: bool,
) -> Result<Value, RpcError> {
    let mut parsed: Map<String, Value> = match serde_json::from_str::<Value>(&body) {
        Ok(Value::Object(obj)) => obj,
        Ok(_) => return Err(RpcError::MalformedResponse(body)),
        Err(_) if !status.is_success() => {
            // Proxies and load balancers answer with HTML while a manager restarts
            return Err(RpcError::Unreachable(format!("HTTP {status}")));
        }
        Err(_) => return Err(RpcError::MalformedResponse(body)),
    };
    match parsed.remove("error") {
        None | Some(Value::Null) => {}
        Some(error) => return Err(normalize_remote_error(error)),
    }
    match parsed.remove("result") {
        Some(result) => Ok(result),
        None if !expect_result => Ok(Value::Null),
        None => Err(RpcError::MalformedResponse(body)),
    }
}
