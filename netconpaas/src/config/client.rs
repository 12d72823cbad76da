use std::path::PathBuf;

use clap::{Args, Subcommand};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::magic::RelativePathBuf,
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
use url::Url;

use crate::{
    entity::state::{ServiceKind, TaskFarmMode},
    error::{Error, Result},
    frontend::Settings,
    poll::PollConfig,
    service::Timeouts,
};

use super::TracingGuard;

/// Filter for the log file. Kept apart from `CPS_FILE_LOG`, which the `CPS_`
/// provider reads as the `file_log` switch.
const FILE_LOG_FILTER_ENV: &str = "CPS_FILE_LOG_LEVEL";

#[derive(Deserialize, Serialize, Debug)]
pub struct ClientConfig {
    pub(crate) director_addr: Option<Url>,
    pub(crate) registry_path: Option<RelativePathBuf>,
    pub(crate) user: Option<String>,
    #[serde(with = "humantime_serde")]
    pub(crate) status_timeout: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) action_timeout: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) stop_timeout: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) poll_initial_interval: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) poll_max_interval: std::time::Duration,
    pub(crate) poll_multiplier: f64,
    pub(crate) poll_max_failures: u32,
    pub(crate) log_path: Option<RelativePathBuf>,
    pub(crate) file_log: bool,
    pub(crate) command: Option<ClientCommand>,
}

#[derive(Args, Debug, Serialize, Default)]
#[command(rename_all = "kebab-case")]
pub struct ClientConfigCli {
    /// The path of the config file
    #[arg(long)]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub config: Option<String>,
    /// The address of the director that provisions managers
    #[arg(short, long = "director")]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub director_addr: Option<String>,
    /// The path of the service registry file
    #[arg(long)]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub registry_path: Option<String>,
    /// The user acting on the services
    #[arg(short, long)]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub user: Option<String>,
    /// Deadline of status calls, default to 10 seconds
    #[arg(long)]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub status_timeout: Option<String>,
    /// Deadline of actions such as script execution, default to 10 minutes
    #[arg(long)]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub action_timeout: Option<String>,
    /// How long a service may stay STOPPING, default to 5 minutes
    #[arg(long)]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub stop_timeout: Option<String>,
    /// Upper bound of the watch interval, default to 30 seconds
    #[arg(long)]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub poll_max_interval: Option<String>,
    /// The log file path. If not specified, then the default rolling log file path would be used.
    /// If specified, then the log file would be exactly at the path specified.
    #[arg(long)]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub log_path: Option<String>,
    /// Enable logging to file
    #[arg(long)]
    #[serde(skip_serializing_if = "::std::ops::Not::not")]
    pub file_log: bool,
    /// The command to run
    #[command(subcommand)]
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub command: Option<ClientCommand>,
}

#[derive(Subcommand, Serialize, Debug, Deserialize)]
pub enum ClientCommand {
    /// Register a new service
    Create(CreateArgs),
    /// List the services of the user
    List,
    /// Show the stored state of a service
    Status(StatusArgs),
    /// Run one reconciliation round against the manager
    Refresh(ServiceArgs),
    /// Refresh until the service settles
    Watch(ServiceArgs),
    /// Stop a service
    Terminate(ServiceArgs),
    /// Check whether the manager of a service moved
    Recheck(ServiceArgs),
    /// Restart a failed service from INIT
    Recover(ServiceArgs),
    /// Lifecycle scripts of a generic service
    Script(ScriptArgs),
    /// Volumes of a generic service
    Volume(VolumeArgs),
    /// Code versions of a generic service
    Code(CodeArgs),
    /// Execution control of a taskfarm service
    Taskfarm(TaskFarmArgs),
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct CreateArgs {
    /// The name of the service
    #[arg(short = 'n', long)]
    pub name: String,
    /// The kind of the service
    #[arg(short, long, value_enum)]
    pub kind: ServiceKind,
    /// The id the manager knows this service by, default to the registry id
    #[arg(long)]
    pub manager_service_id: Option<u64>,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct ServiceArgs {
    /// The id of the service
    pub service_id: u64,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct StatusArgs {
    /// The id of the service
    pub service_id: u64,
    /// Also print the nodes grouped by role
    #[arg(long)]
    pub roles: bool,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct ScriptArgs {
    #[command(subcommand)]
    pub command: ScriptCommands,
}

#[derive(Subcommand, Serialize, Debug, Deserialize)]
pub enum ScriptCommands {
    /// Run the `run.sh` script on every agent
    Run(ScriptRunArgs),
    /// Run the `interrupt.sh` script on every agent
    Interrupt(ScriptRunArgs),
    /// Run the `cleanup.sh` script on every agent
    Cleanup(ScriptRunArgs),
    /// Show the script status of every agent
    Status(ServiceArgs),
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct ScriptRunArgs {
    /// The id of the service
    pub service_id: u64,
    /// Parameters passed to the script
    #[arg(short, long, default_value = "")]
    pub parameters: String,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct VolumeArgs {
    #[command(subcommand)]
    pub command: VolumeCommands,
}

#[derive(Subcommand, Serialize, Debug, Deserialize)]
pub enum VolumeCommands {
    /// List the volumes grouped by node
    List(ServiceArgs),
    /// Create a volume attached to a node
    Create(CreateVolumeArgs),
    /// Delete a volume
    Delete(DeleteVolumeArgs),
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct CreateVolumeArgs {
    /// The id of the service
    pub service_id: u64,
    /// The name of the volume
    #[arg(short = 'n', long)]
    pub name: String,
    /// The size of the volume in MB
    #[arg(short, long)]
    pub size: u64,
    /// The node the volume is attached to
    #[arg(short, long)]
    pub agent: String,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct DeleteVolumeArgs {
    /// The id of the service
    pub service_id: u64,
    /// The name of the volume
    #[arg(short = 'n', long)]
    pub name: String,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct CodeArgs {
    #[command(subcommand)]
    pub command: CodeCommands,
}

#[derive(Subcommand, Serialize, Debug, Deserialize)]
pub enum CodeCommands {
    /// List the uploaded code versions
    List(ServiceArgs),
    /// Upload a new code version
    Upload(UploadCodeArgs),
    /// Enable a code version
    Enable(EnableCodeArgs),
    /// Delete a code version that is not enabled
    Delete(CodeVersionArgs),
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct UploadCodeArgs {
    /// The id of the service
    pub service_id: u64,
    /// The archive to upload
    pub path: PathBuf,
    /// A description of the version
    #[arg(short, long, default_value = "")]
    pub description: String,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct EnableCodeArgs {
    /// The id of the service
    pub service_id: u64,
    /// The code version to enable. HTC services take none.
    pub version_id: Option<String>,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct CodeVersionArgs {
    /// The id of the service
    pub service_id: u64,
    /// The code version
    pub version_id: String,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct TaskFarmArgs {
    #[command(subcommand)]
    pub command: TaskFarmCommands,
}

#[derive(Subcommand, Serialize, Debug, Deserialize)]
pub enum TaskFarmCommands {
    /// Switch between demo and real mode
    Mode(SetModeArgs),
    /// Show the sampling results
    Samplings(ServiceArgs),
    /// Start an execution with one of the sampled schedules
    Execute(ExecuteArgs),
    /// Show the execution progress
    Progress(ServiceArgs),
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct SetModeArgs {
    /// The id of the service
    pub service_id: u64,
    /// The mode to switch to
    #[arg(value_enum)]
    pub mode: TaskFarmMode,
}

#[derive(Serialize, Debug, Deserialize, Args)]
pub struct ExecuteArgs {
    /// The id of the service
    pub service_id: u64,
    /// The sampling results file holding the schedules
    #[arg(short = 'f', long)]
    pub schedules_file: String,
    /// The index of the schedule to run
    #[arg(short = 'i', long, default_value_t = 0)]
    pub schedule_index: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            director_addr: None,
            registry_path: None,
            user: None,
            status_timeout: std::time::Duration::from_secs(10),
            action_timeout: std::time::Duration::from_secs(600),
            stop_timeout: std::time::Duration::from_secs(300),
            poll_initial_interval: std::time::Duration::from_secs(1),
            poll_max_interval: std::time::Duration::from_secs(30),
            poll_multiplier: 2.0,
            poll_max_failures: 5,
            log_path: None,
            file_log: false,
            command: None,
        }
    }
}

impl ClientConfig {
    pub fn new(cli: &ClientConfigCli) -> Result<Self> {
        Ok(Figment::new()
            .merge(Serialized::from(Self::default(), "client"))
            .merge(Toml::file(cli.config.as_deref().unwrap_or("config.toml")).nested())
            .merge(Env::prefixed("CPS_").profile("client"))
            .merge(Serialized::from(cli, "client"))
            .select("client")
            .extract()?)
    }

    /// Runtime settings, rejecting poll parameters that would panic or spin.
    pub fn settings(&self) -> Result<Settings> {
        if !self.poll_multiplier.is_finite() || self.poll_multiplier < 1.0 {
            return Err(Error::ConfigError(figment::Error::from(format!(
                "poll_multiplier must be a finite number of at least 1, got {}",
                self.poll_multiplier
            ))));
        }
        if self.poll_initial_interval.is_zero() || self.poll_max_interval.is_zero() {
            return Err(Error::ConfigError(figment::Error::from(
                "poll intervals must be greater than zero".to_string(),
            )));
        }
        Ok(Settings {
            timeouts: Timeouts {
                status: self.status_timeout,
                action: self.action_timeout,
            },
            stop_timeout: self.stop_timeout,
            poll: PollConfig {
                initial_interval: self.poll_initial_interval,
                max_interval: self.poll_max_interval,
                multiplier: self.poll_multiplier,
                max_consecutive_failures: self.poll_max_failures,
            },
        })
    }

    pub fn director_addr(&self) -> Result<Url> {
        self.director_addr.clone().ok_or_else(|| {
            Error::ConfigError(figment::Error::from(
                "director address not set, use --director or CPS_DIRECTOR_ADDR",
            ))
        })
    }

    pub fn user(&self) -> Result<String> {
        self.user.clone().ok_or_else(|| {
            Error::ConfigError(figment::Error::from(
                "user not set, use --user or CPS_USER",
            ))
        })
    }

    /// The registry file, by default `services.json` under the user data
    /// directory.
    pub fn registry_path(&self) -> Result<PathBuf> {
        self.registry_path
            .as_ref()
            .map(|p| p.relative())
            .or_else(|| {
                dirs::data_dir().map(|mut p| {
                    p.push("conpaas");
                    p.push("services.json");
                    p
                })
            })
            .ok_or(Error::ConfigError(figment::Error::from(
                "registry path not set and data directory not found",
            )))
    }

    pub fn setup_tracing_subscriber(&self) -> Result<TracingGuard> {
        let console_filter = || {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netconpaas=info".into())
        };
        if self.file_log {
            let file_logger = self
                .log_path
                .as_ref()
                .and_then(|p| {
                    let path = p.relative();
                    let dir = path.parent();
                    let file_name = path.file_name();
                    match (dir, file_name) {
                        (Some(dir), Some(file_name)) => {
                            Some(tracing_appender::rolling::never(dir, file_name))
                        }
                        _ => None,
                    }
                })
                .or_else(|| {
                    dirs::cache_dir()
                        .map(|mut p| {
                            p.push("conpaas");
                            p.push("client");
                            p
                        })
                        .map(|dir| tracing_appender::rolling::daily(dir, "client.log"))
                })
                .ok_or(Error::ConfigError(figment::Error::from(
                    "log path not valid and cache directory not found",
                )))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_logger);
            let env_filter = tracing_subscriber::EnvFilter::try_from_env(FILE_LOG_FILTER_ENV)
                .unwrap_or_else(|_| "netconpaas=info".into());
            let client_guard = tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(console_filter()))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_filter(env_filter),
                )
                .set_default();
            Ok(TracingGuard {
                subscriber_guard: Some(client_guard),
                file_guard: Some(guard),
            })
        } else {
            let client_guard = tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(console_filter()))
                .set_default();
            Ok(TracingGuard {
                subscriber_guard: Some(client_guard),
                file_guard: None,
            })
        }
    }
}

impl From<CreateArgs> for ClientCommand {
    fn from(args: CreateArgs) -> Self {
        Self::Create(args)
    }
}

impl From<ScriptArgs> for ClientCommand {
    fn from(args: ScriptArgs) -> Self {
        Self::Script(args)
    }
}

impl From<VolumeArgs> for ClientCommand {
    fn from(args: VolumeArgs) -> Self {
        Self::Volume(args)
    }
}

impl From<CodeArgs> for ClientCommand {
    fn from(args: CodeArgs) -> Self {
        Self::Code(args)
    }
}

impl From<TaskFarmArgs> for ClientCommand {
    fn from(args: TaskFarmArgs) -> Self {
        Self::Taskfarm(args)
    }
}
