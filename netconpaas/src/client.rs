use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        client::{
            ClientCommand, CodeCommands, CreateArgs, ScriptCommands, StatusArgs, TaskFarmCommands,
            VolumeCommands,
        },
        ClientConfig, ClientConfigCli,
    },
    entity::state::ScriptCommand,
    frontend::{CallerContext, Frontend},
    manager::{AddressCheck, DirectorOracle},
    poll::PollOutcome,
    registry::FileRegistry,
    rpc::RpcClient,
    schema::{RemoteStatus, ServiceSummary},
    signal::cancel_on_signal,
};

pub struct ConpaasClient {
    frontend: Frontend,
    user: String,
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => tracing::error!("{}", e),
    }
}

fn log_summary(summary: &ServiceSummary) {
    tracing::info!(
        "service {} ({} {}) is {}",
        summary.service_id,
        summary.kind,
        summary.name,
        summary.lifecycle_state
    );
}

impl ConpaasClient {
    pub async fn main(mut cli: ClientConfigCli) {
        let config = match ClientConfig::new(&cli) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        };
        let _guard = match config.setup_tracing_subscriber() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        };
        match Self::setup(&config) {
            Ok(client) => {
                if let Some(cmd) = cli.command.take() {
                    client.handle_command(cmd).await;
                }
            }
            Err(e) => {
                tracing::error!("{}", e);
            }
        }
    }

    pub fn setup(config: &ClientConfig) -> crate::error::Result<Self> {
        tracing::debug!("Client is setting up");
        let user = config.user()?;
        let settings = config.settings()?;
        let oracle = DirectorOracle::new(
            config.director_addr()?,
            user.clone(),
            settings.timeouts.status,
        );
        let registry = FileRegistry::new(config.registry_path()?);
        let frontend = Frontend::new(
            RpcClient::new(),
            Arc::new(oracle),
            Arc::new(registry),
            settings,
        );
        Ok(ConpaasClient { frontend, user })
    }

    fn ctx(&self, service_id: u64) -> CallerContext {
        CallerContext::new(service_id, self.user.clone())
    }

    pub async fn create_service(&self, args: CreateArgs) -> crate::error::Result<ServiceSummary> {
        self.frontend
            .create_service(&self.user, &args.name, args.kind, args.manager_service_id)
            .await
    }

    pub async fn status(&self, args: &StatusArgs) -> crate::error::Result<()> {
        let ctx = self.ctx(args.service_id);
        print_json(&self.frontend.summary(&ctx).await?);
        if args.roles {
            for group in self.frontend.role_groups(&ctx).await? {
                println!("[{}] {}", group.style.label, group.style.css_class);
                for node in group.nodes {
                    println!(
                        "  {} {}",
                        node.node_id,
                        node.ip_address.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Ok(())
    }

    /// Refreshes until the service settles. Ctrl+C stops watching without
    /// touching the service.
    pub async fn watch(&self, service_id: u64) -> crate::error::Result<()> {
        let token = CancellationToken::new();
        let signal_hd = tokio::spawn(cancel_on_signal(token.clone()));
        let outcome = self
            .frontend
            .watch(&self.ctx(service_id), log_summary, token.clone())
            .await;
        token.cancel();
        let _ = signal_hd.await;
        match outcome? {
            PollOutcome::Converged(summary) => {
                tracing::info!("service {} settled", summary.service_id);
                print_json(&summary);
                Ok(())
            }
            PollOutcome::Cancelled => {
                tracing::warn!("stopped watching service {}", service_id);
                Ok(())
            }
            PollOutcome::PersistentFailure {
                failures,
                last_error,
            } => {
                tracing::error!(
                    "service {} unreachable after {} attempts",
                    service_id,
                    failures
                );
                Err(last_error)
            }
            PollOutcome::Failed(e) => Err(e),
        }
    }

    pub async fn handle_command<T>(&self, cmd: T)
    where
        T: Into<ClientCommand>,
    {
        if let Err(e) = self.dispatch(cmd.into()).await {
            tracing::error!("{}", e);
        }
    }

    async fn dispatch(&self, cmd: ClientCommand) -> crate::error::Result<()> {
        match cmd {
            ClientCommand::Create(args) => {
                let summary = self.create_service(args).await?;
                tracing::info!("Successfully created service {}", summary.service_id);
                print_json(&summary);
            }
            ClientCommand::List => {
                let services = self.frontend.list_services(&self.user).await?;
                if services.is_empty() {
                    tracing::info!("No services found for {}", self.user);
                }
                for summary in services {
                    println!(
                        "{:>6}  {:<10} {:<9} {}",
                        summary.service_id,
                        summary.kind.to_string(),
                        summary.lifecycle_state.to_string(),
                        summary.name
                    );
                }
            }
            ClientCommand::Status(args) => self.status(&args).await?,
            ClientCommand::Refresh(args) => {
                let summary = self.frontend.refresh(&self.ctx(args.service_id)).await?;
                print_json(&summary);
            }
            ClientCommand::Watch(args) => self.watch(args.service_id).await?,
            ClientCommand::Terminate(args) => {
                let summary = self.frontend.terminate(&self.ctx(args.service_id)).await?;
                tracing::info!("Service {} is stopping", summary.service_id);
            }
            ClientCommand::Recheck(args) => {
                match self
                    .frontend
                    .recheck_manager(&self.ctx(args.service_id))
                    .await?
                {
                    AddressCheck::Unchanged => tracing::info!("Manager address unchanged"),
                    AddressCheck::Resolved(address) => {
                        tracing::info!("Manager resolved at {}", address)
                    }
                    AddressCheck::Changed { previous, current } => {
                        tracing::info!("Manager moved from {} to {}", previous, current)
                    }
                    AddressCheck::Unresolved => tracing::info!("Manager not provisioned yet"),
                }
            }
            ClientCommand::Recover(args) => {
                let summary = self.frontend.recover(&self.ctx(args.service_id)).await?;
                log_summary(&summary);
            }
            ClientCommand::Script(args) => match args.command {
                ScriptCommands::Run(run) => {
                    self.run_script(run.service_id, ScriptCommand::Run, run.parameters)
                        .await?
                }
                ScriptCommands::Interrupt(run) => {
                    self.run_script(run.service_id, ScriptCommand::Interrupt, run.parameters)
                        .await?
                }
                ScriptCommands::Cleanup(run) => {
                    self.run_script(run.service_id, ScriptCommand::Cleanup, run.parameters)
                        .await?
                }
                ScriptCommands::Status(args) => {
                    match self.frontend.script_status(&self.ctx(args.service_id)).await? {
                        Some(status) => print_json(&status),
                        None => tracing::info!("No script status available"),
                    }
                }
            },
            ClientCommand::Volume(args) => match args.command {
                VolumeCommands::List(args) => {
                    let volumes = self.frontend.list_volumes(&self.ctx(args.service_id)).await?;
                    for volume in volumes {
                        println!(
                            "{:<20} {:>8} MB  {}",
                            volume.name, volume.size_mb, volume.agent_id
                        );
                    }
                }
                VolumeCommands::Create(args) => {
                    self.frontend
                        .create_volume(&self.ctx(args.service_id), args.name, args.size, args.agent)
                        .await?;
                    tracing::info!("Successfully created volume");
                }
                VolumeCommands::Delete(args) => {
                    self.frontend
                        .delete_volume(&self.ctx(args.service_id), args.name)
                        .await?;
                    tracing::info!("Successfully deleted volume");
                }
            },
            ClientCommand::Code(args) => match args.command {
                CodeCommands::List(args) => {
                    let versions = self
                        .frontend
                        .list_code_versions(&self.ctx(args.service_id))
                        .await?;
                    for version in versions {
                        println!(
                            "{} {:<16} {:<24} {}",
                            if version.current { "*" } else { " " },
                            version.version_id,
                            version.filename,
                            version.description
                        );
                    }
                }
                CodeCommands::Upload(args) => {
                    let content = tokio::fs::read(&args.path).await?;
                    let file_name = args
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "code".to_string());
                    let result = self
                        .frontend
                        .upload_code_version(
                            &self.ctx(args.service_id),
                            file_name,
                            content,
                            args.description,
                        )
                        .await?;
                    tracing::info!("Successfully uploaded code: {}", result);
                }
                CodeCommands::Enable(args) => {
                    self.frontend
                        .send_configuration(&self.ctx(args.service_id), args.version_id)
                        .await?;
                    tracing::info!("Successfully configured service {}", args.service_id);
                }
                CodeCommands::Delete(args) => {
                    self.frontend
                        .delete_code_version(&self.ctx(args.service_id), args.version_id)
                        .await?;
                    tracing::info!("Successfully deleted code version");
                }
            },
            ClientCommand::Taskfarm(args) => match args.command {
                TaskFarmCommands::Mode(args) => {
                    self.frontend
                        .set_mode(&self.ctx(args.service_id), args.mode)
                        .await?;
                    tracing::info!("Service {} is now in {} mode", args.service_id, args.mode);
                }
                TaskFarmCommands::Samplings(args) => {
                    let samplings = self
                        .frontend
                        .sampling_results(&self.ctx(args.service_id))
                        .await?;
                    if samplings.is_empty() {
                        tracing::info!("No samples yet");
                    }
                    print_json(&samplings);
                }
                TaskFarmCommands::Execute(args) => {
                    self.frontend
                        .start_execution(
                            &self.ctx(args.service_id),
                            args.schedules_file,
                            args.schedule_index,
                        )
                        .await?;
                    tracing::info!("Execution started");
                }
                TaskFarmCommands::Progress(args) => {
                    match self.frontend.progress(&self.ctx(args.service_id)).await? {
                        RemoteStatus::Available(p) => println!(
                            "{} mode: {}/{} tasks done, {} spent",
                            p.mode, p.completed_tasks, p.total_tasks, p.money_spent
                        ),
                        RemoteStatus::Unavailable => {
                            tracing::info!("Service reports no progress yet")
                        }
                    }
                }
            },
        }
        Ok(())
    }

    async fn run_script(
        &self,
        service_id: u64,
        command: ScriptCommand,
        parameters: String,
    ) -> crate::error::Result<()> {
        self.frontend
            .execute_script(&self.ctx(service_id), command, parameters)
            .await?;
        tracing::info!("Successfully started {} script", command);
        Ok(())
    }
}
