use std::{fmt::Display, str::FromStr};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Coarse lifecycle of a service as seen by the frontend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Created locally, manager address not yet known
    Init,
    /// Manager known, nodes still being provisioned
    Starting,
    Running,
    /// Termination requested, waiting for the manager to confirm
    Stopping,
    Stopped,
    /// Terminal until the user asks for recovery
    Error,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::Init,
        LifecycleState::Starting,
        LifecycleState::Running,
        LifecycleState::Stopping,
        LifecycleState::Stopped,
        LifecycleState::Error,
    ];

    pub fn needs_polling(&self) -> bool {
        matches!(
            self,
            LifecycleState::Init | LifecycleState::Starting | LifecycleState::Stopping
        )
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            LifecycleState::Running | LifecycleState::Stopped | LifecycleState::Error
        )
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Init => write!(f, "INIT"),
            LifecycleState::Starting => write!(f, "STARTING"),
            LifecycleState::Running => write!(f, "RUNNING"),
            LifecycleState::Stopping => write!(f, "STOPPING"),
            LifecycleState::Stopped => write!(f, "STOPPED"),
            LifecycleState::Error => write!(f, "ERROR"),
        }
    }
}

/// What the manager itself reports in the `state` field of its service info.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemotePhase {
    /// INIT, PROLOGUE and any state we do not know about
    Provisioning,
    /// RUNNING or ADAPTING
    Running,
    /// EPILOGUE
    ShuttingDown,
    Stopped,
    Failed,
}

impl From<&str> for RemotePhase {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" | "ADAPTING" => RemotePhase::Running,
            "EPILOGUE" => RemotePhase::ShuttingDown,
            "STOPPED" => RemotePhase::Stopped,
            "ERROR" => RemotePhase::Failed,
            _ => RemotePhase::Provisioning,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Code execution service with master and worker nodes
    Generic,
    /// Batch task farming with sampling and budgeted execution
    #[value(name = "taskfarm")]
    TaskFarm,
    /// High throughput computing grid
    Htc,
}

impl FromStr for ServiceKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" | "Generic" => Ok(Self::Generic),
            "taskfarm" | "TaskFarm" => Ok(Self::TaskFarm),
            "htc" | "HTC" => Ok(Self::Htc),
            _ => Err(crate::error::Error::Custom(format!(
                "Invalid ServiceKind: {s}"
            ))),
        }
    }
}

impl Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::Generic => write!(f, "generic"),
            ServiceKind::TaskFarm => write!(f, "taskfarm"),
            ServiceKind::Htc => write!(f, "htc"),
        }
    }
}

/// Whether a taskfarm execution spends real budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum TaskFarmMode {
    #[default]
    #[serde(rename = "NA")]
    #[value(skip)]
    NotSet,
    #[serde(rename = "DEMO", alias = "demo")]
    Demo,
    #[serde(rename = "REAL", alias = "real")]
    Real,
}

impl TaskFarmMode {
    pub fn as_wire(&self) -> &'static str {
        match self {
            TaskFarmMode::NotSet => "NA",
            TaskFarmMode::Demo => "DEMO",
            TaskFarmMode::Real => "REAL",
        }
    }
}

impl Display for TaskFarmMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// Lifecycle scripts a generic service can run on its nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScriptCommand {
    Run,
    Interrupt,
    Cleanup,
}

impl ScriptCommand {
    /// Name of the script file the agents report status for.
    pub fn script_name(&self) -> &'static str {
        match self {
            ScriptCommand::Run => "run.sh",
            ScriptCommand::Interrupt => "interrupt.sh",
            ScriptCommand::Cleanup => "cleanup.sh",
        }
    }
}

impl Display for ScriptCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptCommand::Run => write!(f, "run"),
            ScriptCommand::Interrupt => write!(f, "interrupt"),
            ScriptCommand::Cleanup => write!(f, "cleanup"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

/// How a manager endpoint is reached when its address carries no scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Plain { port: u16 },
    Tls { port: u16 },
}

impl Transport {
    pub fn endpoint(&self, address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            return address.trim_end_matches('/').to_string();
        }
        match self {
            Transport::Plain { port } => format!("http://{address}:{port}"),
            Transport::Tls { port } => format!("https://{address}:{port}"),
        }
    }
}
