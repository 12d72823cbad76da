use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::entity::{
    role::RoleStyle,
    state::{LifecycleState, ServiceKind, TaskFarmMode},
};

/// Body of a POST call. GET calls carry the same keys in the query string.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub service_id: u64,
    pub method: &'a str,
    pub params: &'a Value,
    pub id: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInfo {
    pub state: String,
    #[serde(rename = "type", default)]
    pub service_type: Option<String>,
}

/// Progress counters reported by a taskfarm manager in its service info.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionProgress {
    #[serde(default)]
    pub mode: TaskFarmMode,
    #[serde(rename = "moneySpent", default)]
    pub money_spent: f64,
    #[serde(rename = "noCompletedTasks", default)]
    pub completed_tasks: u64,
    #[serde(rename = "noTotalTasks", default)]
    pub total_tasks: u64,
}

impl ExecutionProgress {
    pub fn in_flight(&self) -> bool {
        self.completed_tasks < self.total_tasks
    }
}

/// Managers are not consistent about whether identifiers are numbers or strings.
pub fn id_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deserialize_id<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(d)?;
    id_to_string(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid identifier {v}")))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeLists {
    #[serde(flatten)]
    pub by_role: BTreeMap<String, Vec<Value>>,
}

impl NodeLists {
    /// Role to node id lists, dropping entries that are not identifiers.
    pub fn into_ids(self) -> BTreeMap<String, Vec<String>> {
        self.by_role
            .into_iter()
            .map(|(role, ids)| (role, ids.iter().filter_map(id_to_string).collect()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfoResp {
    #[serde(rename = "serviceNode")]
    pub service_node: NodeInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub cloud: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    #[serde(rename = "volumeName", alias = "vol_name")]
    pub name: String,
    #[serde(rename = "volumeSize", alias = "vol_size", default)]
    pub size_mb: u64,
    #[serde(rename = "agentId", alias = "vm_id", deserialize_with = "deserialize_id")]
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeList {
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeVersion {
    #[serde(rename = "codeVersionId")]
    pub version_id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub current: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeVersionList {
    #[serde(rename = "codeVersions", default)]
    pub code_versions: Vec<CodeVersion>,
}

/// Status of each lifecycle script on one agent, keyed by script file name.
pub type ScriptStatus = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptStatusResp {
    #[serde(default)]
    pub agents: BTreeMap<String, ScriptStatus>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScheduleCandidate {
    #[serde(rename = "time")]
    pub estimated_time: f64,
    #[serde(rename = "cost")]
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingResult {
    pub name: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub schedules: Vec<ScheduleCandidate>,
}

/// Last successfully fetched status payload of a manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedRemoteState {
    pub payload: Value,
    pub fetched_at: OffsetDateTime,
}

impl CachedRemoteState {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            fetched_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Outcome of a status fetch. `Unavailable` means the manager answered but
/// has nothing to report, which is different from a failed call.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStatus<T> {
    Available(T),
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSummary {
    pub node_id: String,
    pub role: String,
    pub ip_address: Option<String>,
    pub cloud_provider: Option<String>,
    pub volumes: Vec<Volume>,
    pub script_status: Option<ScriptStatus>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoleGroup {
    pub style: RoleStyle,
    pub nodes: Vec<NodeSummary>,
}

/// Read-only projection handed to whatever renders a service.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceSummary {
    pub service_id: u64,
    pub name: String,
    pub kind: ServiceKind,
    pub lifecycle_state: LifecycleState,
    pub manager_address: Option<String>,
    pub needs_polling: bool,
    pub access_location: Option<String>,
    pub nodes: BTreeMap<String, Vec<NodeSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taskfarm: Option<TaskFarmSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_code_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskFarmSummary {
    pub mode: TaskFarmMode,
    pub money_spent: f64,
    pub completed_tasks: u64,
    pub total_tasks: u64,
}
