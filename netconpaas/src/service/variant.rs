use std::{collections::BTreeMap, fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    entity::state::{HttpMethod, LifecycleState, ServiceKind, TaskFarmMode, Transport},
    error::Error,
    schema::{CodeVersion, ExecutionProgress, SamplingResult, ScriptStatus},
};

/// Abstract operations a frontend can ask of a manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchState,
    ListNodes,
    GetNodeInfo,
    SendConfiguration,
    ExecuteScript,
    GetScriptStatus,
    ListVolumes,
    CreateVolume,
    DeleteVolume,
    ListCodeVersions,
    UploadCodeVersion,
    DeleteCodeVersion,
    TerminateWorkers,
    SetMode,
    StartExecution,
    GetSamplingResults,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::FetchState => "fetch state",
            Operation::ListNodes => "list nodes",
            Operation::GetNodeInfo => "get node info",
            Operation::SendConfiguration => "send configuration",
            Operation::ExecuteScript => "execute script",
            Operation::GetScriptStatus => "get script status",
            Operation::ListVolumes => "list volumes",
            Operation::CreateVolume => "create volume",
            Operation::DeleteVolume => "delete volume",
            Operation::ListCodeVersions => "list code versions",
            Operation::UploadCodeVersion => "upload code version",
            Operation::DeleteCodeVersion => "delete code version",
            Operation::TerminateWorkers => "terminate workers",
            Operation::SetMode => "set mode",
            Operation::StartExecution => "start execution",
            Operation::GetSamplingResults => "get sampling results",
        };
        write!(f, "{name}")
    }
}

/// Concrete wire method backing an [`Operation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcMethod {
    pub name: &'static str,
    pub http: HttpMethod,
    /// Safe to repeat, so failures may be retried by a poller
    pub idempotent: bool,
}

const fn get(name: &'static str) -> RpcMethod {
    RpcMethod {
        name,
        http: HttpMethod::Get,
        idempotent: true,
    }
}

const fn post(name: &'static str) -> RpcMethod {
    RpcMethod {
        name,
        http: HttpMethod::Post,
        idempotent: false,
    }
}

const fn post_query(name: &'static str) -> RpcMethod {
    RpcMethod {
        name,
        http: HttpMethod::Post,
        idempotent: true,
    }
}

static GENERIC_METHODS: &[(Operation, RpcMethod)] = &[
    (Operation::FetchState, get("get_service_info")),
    (Operation::ListNodes, get("list_nodes")),
    (Operation::GetNodeInfo, get("get_node_info")),
    (Operation::SendConfiguration, post("enable_code")),
    (Operation::ExecuteScript, post("execute_script")),
    (Operation::GetScriptStatus, get("get_script_status")),
    (Operation::ListVolumes, post_query("list_volumes")),
    (Operation::CreateVolume, post("generic_create_volume")),
    (Operation::DeleteVolume, post("generic_delete_volume")),
    (Operation::ListCodeVersions, get("list_code_versions")),
    (Operation::UploadCodeVersion, post("upload_code_version")),
    (Operation::DeleteCodeVersion, post("delete_code_version")),
];

static TASKFARM_METHODS: &[(Operation, RpcMethod)] = &[
    (Operation::FetchState, post_query("get_service_info")),
    (Operation::TerminateWorkers, post("terminate_workers")),
    (Operation::SetMode, post("set_service_mode")),
    (Operation::StartExecution, post("start_execution")),
    (Operation::GetSamplingResults, post_query("get_sampling_results")),
];

static HTC_METHODS: &[(Operation, RpcMethod)] = &[
    (Operation::FetchState, get("get_service_info")),
    (Operation::ListNodes, get("list_nodes")),
    (Operation::GetNodeInfo, get("get_node_info")),
];

const TASKFARM_PORT: u16 = 8475;
const TLS_PORT: u16 = 443;
const HTC_CONSOLE_PORT: u16 = 4444;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenericState {
    #[serde(default)]
    pub code_versions: Vec<CodeVersion>,
    /// Per node status of the lifecycle scripts, `None` until the manager
    /// has reported one while running
    #[serde(default)]
    pub script_status: Option<BTreeMap<String, ScriptStatus>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskFarmState {
    #[serde(default)]
    pub mode: TaskFarmMode,
    #[serde(default)]
    pub progress: Option<ExecutionProgress>,
    #[serde(default)]
    pub sampling_results: Vec<SamplingResult>,
}

impl TaskFarmState {
    pub fn execution_active(&self) -> bool {
        self.progress.is_some_and(|p| p.in_flight())
    }
}

/// Per kind behavior, carried as data so every match over kinds is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServiceVariant {
    Generic(GenericState),
    #[serde(rename = "taskfarm")]
    TaskFarm(TaskFarmState),
    Htc,
}

impl ServiceVariant {
    pub fn new(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::Generic => ServiceVariant::Generic(GenericState::default()),
            ServiceKind::TaskFarm => ServiceVariant::TaskFarm(TaskFarmState::default()),
            ServiceKind::Htc => ServiceVariant::Htc,
        }
    }

    pub fn kind(&self) -> ServiceKind {
        match self {
            ServiceVariant::Generic(_) => ServiceKind::Generic,
            ServiceVariant::TaskFarm(_) => ServiceKind::TaskFarm,
            ServiceVariant::Htc => ServiceKind::Htc,
        }
    }

    pub fn rpc_methods(&self) -> &'static [(Operation, RpcMethod)] {
        match self {
            ServiceVariant::Generic(_) => GENERIC_METHODS,
            ServiceVariant::TaskFarm(_) => TASKFARM_METHODS,
            ServiceVariant::Htc => HTC_METHODS,
        }
    }

    pub fn rpc_method(&self, operation: Operation) -> crate::error::Result<RpcMethod> {
        self.rpc_methods()
            .iter()
            .find(|(op, _)| *op == operation)
            .map(|(_, method)| *method)
            .ok_or(Error::UnsupportedOperation {
                operation,
                kind: self.kind(),
            })
    }

    /// Roles that must each hold at least one node before the service counts
    /// as running. Taskfarm managers do not report nodes at all.
    pub fn instance_roles(&self) -> &'static [&'static str] {
        match self {
            ServiceVariant::Generic(_) => &["master", "node"],
            ServiceVariant::TaskFarm(_) => &[],
            ServiceVariant::Htc => &["agent"],
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            ServiceVariant::TaskFarm(_) => Transport::Plain {
                port: TASKFARM_PORT,
            },
            ServiceVariant::Generic(_) | ServiceVariant::Htc => Transport::Tls { port: TLS_PORT },
        }
    }

    /// Upper bound on the poll interval, tighter for taskfarm so progress
    /// counters stay fresh during an execution.
    pub fn max_poll_interval(&self) -> Option<Duration> {
        match self {
            ServiceVariant::TaskFarm(_) => Some(Duration::from_secs(2)),
            ServiceVariant::Generic(_) | ServiceVariant::Htc => None,
        }
    }

    pub fn execution_active(&self) -> bool {
        match self {
            ServiceVariant::TaskFarm(state) => state.execution_active(),
            ServiceVariant::Generic(_) | ServiceVariant::Htc => false,
        }
    }

    pub fn needs_polling(&self, state: LifecycleState) -> bool {
        state.needs_polling() || self.execution_active()
    }

    pub fn is_stable(&self, state: LifecycleState) -> bool {
        state.is_settled() && !self.execution_active()
    }

    /// Drops everything learned from a previous manager generation.
    pub fn reset_remote_view(&mut self) {
        match self {
            ServiceVariant::Generic(state) => {
                state.script_status = None;
                state.code_versions.clear();
            }
            ServiceVariant::TaskFarm(state) => {
                state.progress = None;
                state.sampling_results.clear();
            }
            ServiceVariant::Htc => {}
        }
    }

    pub fn access_location(&self, agent_ip: Option<&str>) -> Option<String> {
        match self {
            ServiceVariant::Htc => {
                agent_ip.map(|ip| format!("http://{ip}:{HTC_CONSOLE_PORT}/grid/console"))
            }
            ServiceVariant::Generic(_) | ServiceVariant::TaskFarm(_) => None,
        }
    }
}
