//! Entry point for every management action.
//!
//! Each call is an independent unit of work: load the record, check the
//! caller owns it, talk to the manager, save what changed. Nothing is shared
//! between calls except the durable registry, so two pollers on the same
//! service only ever race on idempotent writes.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    entity::state::{LifecycleState, ScriptCommand, ServiceKind, TaskFarmMode},
    error::{Error, Result},
    manager::{AddressCheck, ManagerHandle, ProvisioningOracle},
    poll::{self, PollConfig, PollOutcome},
    registry::ServiceRegistry,
    rpc::RpcClient,
    schema::{
        CodeVersion, ExecutionProgress, RemoteStatus, RoleGroup, SamplingResult, ScriptStatus,
        ServiceSummary, Volume,
    },
    service::{
        name_validator, state::LifecycleEvent, variant::ServiceVariant, RecordPatch, Service,
        Timeouts,
    },
};

/// Who is acting on which service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub service_id: u64,
    pub caller_id: String,
}

impl CallerContext {
    pub fn new(service_id: u64, caller_id: impl Into<String>) -> Self {
        Self {
            service_id,
            caller_id: caller_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub timeouts: Timeouts,
    /// How long STOPPING may last before the service is considered stopped
    pub stop_timeout: Duration,
    pub poll: PollConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            stop_timeout: Duration::from_secs(300),
            poll: PollConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct Frontend {
    rpc: RpcClient,
    oracle: Arc<dyn ProvisioningOracle>,
    registry: Arc<dyn ServiceRegistry>,
    settings: Settings,
}

impl Frontend {
    pub fn new(
        rpc: RpcClient,
        oracle: Arc<dyn ProvisioningOracle>,
        registry: Arc<dyn ServiceRegistry>,
        settings: Settings,
    ) -> Self {
        Self {
            rpc,
            oracle,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Loads the record for `ctx` and returns it twice: one copy to work on
    /// and the original to diff against when saving.
    async fn checkout(&self, ctx: &CallerContext) -> Result<(Service, Service)> {
        let service = self.registry.load(ctx.service_id).await?;
        if service.owner_id != ctx.caller_id {
            return Err(Error::PermissionDenied(format!(
                "service {} does not belong to {}",
                ctx.service_id, ctx.caller_id
            )));
        }
        Ok((service.clone(), service))
    }

    /// Writes what changed since `original` and returns the stored record,
    /// which may differ from `service` when another caller got there first.
    async fn save(&self, service: &Service, original: &Service) -> Result<Service> {
        let patch = service.diff(original);
        if patch.is_empty() {
            return Ok(service.clone());
        }
        self.registry.save(service.service_id, patch).await
    }

    /// Saves the outcome of a user action. A transport failure triggers an
    /// address recheck: if the manager moved, the service restarts from INIT
    /// and the caller gets [`Error::StaleManager`] instead.
    async fn commit<T>(
        &self,
        mut service: Service,
        original: &Service,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(Error::Transport { .. }) = &result {
            let mut handle = ManagerHandle::new(
                self.oracle.as_ref(),
                service.service_id,
                service.manager_address.clone(),
            );
            if let Ok(AddressCheck::Changed { current, .. }) =
                handle.recheck_and_maybe_update(self.registry.as_ref()).await
            {
                service.manager_address = Some(current.clone());
                service.apply(LifecycleEvent::ManagerMoved)?;
                self.save(&service, original).await?;
                return Err(Error::StaleManager {
                    service_id: service.service_id,
                    address: current,
                });
            }
        }
        self.save(&service, original).await?;
        result
    }

    pub async fn create_service(
        &self,
        caller_id: &str,
        name: &str,
        kind: ServiceKind,
        manager_service_id: Option<u64>,
    ) -> Result<ServiceSummary> {
        if !name_validator(name) {
            return Err(Error::Custom(format!("invalid service name {name:?}")));
        }
        let mut draft = Service::new(caller_id.to_string(), name.to_string(), kind);
        draft.manager_service_id = manager_service_id.unwrap_or_default();
        let service = self.registry.insert(draft).await?;
        tracing::info!("created {} service {} ({})", kind, service.service_id, name);
        Ok(service.to_summary())
    }

    pub async fn list_services(&self, caller_id: &str) -> Result<Vec<ServiceSummary>> {
        Ok(self
            .registry
            .list(caller_id)
            .await?
            .iter()
            .map(Service::to_summary)
            .collect())
    }

    /// Summary of the stored record without contacting anything remote.
    pub async fn summary(&self, ctx: &CallerContext) -> Result<ServiceSummary> {
        let (service, _) = self.checkout(ctx).await?;
        Ok(service.to_summary())
    }

    pub async fn role_groups(&self, ctx: &CallerContext) -> Result<Vec<RoleGroup>> {
        let (service, _) = self.checkout(ctx).await?;
        service.role_groups()
    }

    /// One reconciliation round: check where the manager lives, then ask it
    /// for its state. A service that reaches STOPPED is removed from the
    /// registry and its final summary returned.
    pub async fn refresh(&self, ctx: &CallerContext) -> Result<ServiceSummary> {
        let (mut service, original) = self.checkout(ctx).await?;
        let result = self.reconcile(&mut service).await;
        let stored = if service.lifecycle_state() == LifecycleState::Stopped {
            self.registry.remove(service.service_id).await?;
            tracing::info!("service {} stopped and removed", service.service_id);
            service
        } else {
            self.save(&service, &original).await?
        };
        result.map(|_| stored.to_summary())
    }

    /// In ERROR only the address is rechecked: a moved manager restarts the
    /// service from INIT, otherwise it waits for [`Frontend::recover`].
    async fn reconcile(&self, service: &mut Service) -> Result<()> {
        if service.lifecycle_state() == LifecycleState::Stopped {
            return Ok(());
        }
        let mut handle = ManagerHandle::new(
            self.oracle.as_ref(),
            service.service_id,
            service.manager_address.clone(),
        );
        match handle
            .recheck_and_maybe_update(self.registry.as_ref())
            .await?
        {
            AddressCheck::Changed { current, .. } => {
                service.manager_address = Some(current);
                service.apply(LifecycleEvent::ManagerMoved)?;
                // Start over from the new manager on the next round
                return Ok(());
            }
            _ if service.lifecycle_state() == LifecycleState::Error => return Ok(()),
            AddressCheck::Resolved(address) => {
                service.manager_address = Some(address);
                service.apply(LifecycleEvent::AddressResolved)?;
            }
            AddressCheck::Unchanged => {
                service.apply(LifecycleEvent::AddressResolved)?;
            }
            AddressCheck::Unresolved => {
                if service.lifecycle_state() == LifecycleState::Stopping {
                    // The provisioning layer has released the manager
                    service.apply(LifecycleEvent::ShutdownConfirmed)?;
                    return Ok(());
                }
                if service.manager_address.is_none() {
                    return Ok(());
                }
            }
        }
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        service
            .sync_with_manager(&link, self.settings.stop_timeout)
            .await
    }

    /// Polls until the service settles, the token is cancelled, or polling
    /// gives up. `on_update` sees every successful round.
    pub async fn watch<U>(
        &self,
        ctx: &CallerContext,
        on_update: U,
        token: CancellationToken,
    ) -> Result<PollOutcome<ServiceSummary>>
    where
        U: FnMut(&ServiceSummary),
    {
        let (service, _) = self.checkout(ctx).await?;
        let config = match service.variant.max_poll_interval() {
            Some(max) => self.settings.poll.with_max_interval(max),
            None => self.settings.poll,
        };
        Ok(poll::run(
            || self.refresh(ctx),
            |summary: &ServiceSummary| !summary.needs_polling,
            on_update,
            config,
            token,
        )
        .await)
    }

    /// Moves the service to STOPPING and asks the provisioning layer to stop
    /// it. Taskfarm workers are released first, best effort.
    ///
    /// STOPPING is claimed in the registry before anything remote happens, so
    /// of several concurrent requests only one reaches the provisioning layer
    /// and the others fail with [`Error::Conflict`].
    pub async fn terminate(&self, ctx: &CallerContext) -> Result<ServiceSummary> {
        let (mut service, original) = self.checkout(ctx).await?;
        match service.lifecycle_state() {
            LifecycleState::Stopping => return Ok(service.to_summary()),
            LifecycleState::Stopped => {
                return Err(Error::Conflict(format!(
                    "service {} is already stopped",
                    service.service_id
                )))
            }
            _ => {}
        }
        service.apply(LifecycleEvent::TerminateRequested)?;
        let claimed = self
            .registry
            .save(service.service_id, service.diff(&original).exclusive())
            .await?;
        if matches!(service.variant, ServiceVariant::TaskFarm(_)) {
            if let Ok(link) = service.link(&self.rpc, self.settings.timeouts) {
                if let Err(e) = service.terminate_workers(&link).await {
                    tracing::warn!(
                        "could not release workers of service {}: {}",
                        service.service_id,
                        e
                    );
                }
            }
        }
        let handle = ManagerHandle::new(
            self.oracle.as_ref(),
            service.service_id,
            service.manager_address.clone(),
        );
        if let Err(e) = handle.terminate(&ctx.caller_id).await {
            let rollback = RecordPatch {
                lifecycle_state: Some(original.lifecycle_state),
                stopping_since: Some(original.stopping_since),
                base_state: Some(LifecycleState::Stopping),
                exclusive: true,
                ..Default::default()
            };
            if let Err(rollback_err) = self.registry.save(service.service_id, rollback).await {
                tracing::warn!(
                    "could not restore service {} after failed termination: {}",
                    service.service_id,
                    rollback_err
                );
            }
            return Err(e);
        }
        Ok(claimed.to_summary())
    }

    pub async fn recheck_manager(&self, ctx: &CallerContext) -> Result<AddressCheck> {
        let (mut service, original) = self.checkout(ctx).await?;
        let mut handle = ManagerHandle::new(
            self.oracle.as_ref(),
            service.service_id,
            service.manager_address.clone(),
        );
        let check = handle
            .recheck_and_maybe_update(self.registry.as_ref())
            .await?;
        match &check {
            AddressCheck::Changed { current, .. } => {
                service.manager_address = Some(current.clone());
                service.apply(LifecycleEvent::ManagerMoved)?;
            }
            AddressCheck::Resolved(address) => {
                service.manager_address = Some(address.clone());
                service.apply(LifecycleEvent::AddressResolved)?;
            }
            AddressCheck::Unchanged | AddressCheck::Unresolved => {}
        }
        self.save(&service, &original).await?;
        Ok(check)
    }

    /// Leaves ERROR by starting over from INIT.
    pub async fn recover(&self, ctx: &CallerContext) -> Result<ServiceSummary> {
        let (mut service, original) = self.checkout(ctx).await?;
        service.apply(LifecycleEvent::Recover)?;
        self.save(&service, &original).await?;
        Ok(service.to_summary())
    }

    pub async fn execute_script(
        &self,
        ctx: &CallerContext,
        command: ScriptCommand,
        parameters: String,
    ) -> Result<Value> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.execute_script(&link, command, parameters).await;
        self.commit(service, &original, result).await
    }

    pub async fn script_status(
        &self,
        ctx: &CallerContext,
    ) -> Result<Option<BTreeMap<String, ScriptStatus>>> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.update_script_status(&link).await;
        self.commit(service, &original, result).await
    }

    pub async fn list_volumes(&self, ctx: &CallerContext) -> Result<Vec<Volume>> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.update_volumes(&link).await;
        self.commit(service, &original, result).await
    }

    pub async fn create_volume(
        &self,
        ctx: &CallerContext,
        name: String,
        size_mb: u64,
        agent_id: String,
    ) -> Result<Value> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.create_volume(&link, name, size_mb, agent_id).await;
        self.commit(service, &original, result).await
    }

    pub async fn delete_volume(&self, ctx: &CallerContext, name: String) -> Result<Value> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.delete_volume(&link, name).await;
        self.commit(service, &original, result).await
    }

    pub async fn list_code_versions(&self, ctx: &CallerContext) -> Result<Vec<CodeVersion>> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.list_code_versions(&link).await;
        self.commit(service, &original, result).await
    }

    pub async fn upload_code_version(
        &self,
        ctx: &CallerContext,
        file_name: String,
        content: Vec<u8>,
        description: String,
    ) -> Result<Value> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service
            .upload_code_version(&link, file_name, content, description)
            .await;
        self.commit(service, &original, result).await
    }

    /// Sends the configuration call of the variant; for generic services this
    /// enables `code_version`.
    pub async fn send_configuration(
        &self,
        ctx: &CallerContext,
        code_version: Option<String>,
    ) -> Result<Value> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.send_configuration(&link, code_version).await;
        self.commit(service, &original, result).await
    }

    pub async fn delete_code_version(
        &self,
        ctx: &CallerContext,
        version_id: String,
    ) -> Result<Value> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.delete_code_version(&link, version_id).await;
        self.commit(service, &original, result).await
    }

    pub async fn set_mode(&self, ctx: &CallerContext, mode: TaskFarmMode) -> Result<Value> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.set_mode(&link, mode).await;
        self.commit(service, &original, result).await
    }

    pub async fn start_execution(
        &self,
        ctx: &CallerContext,
        schedules_file: String,
        schedule_index: u32,
    ) -> Result<Value> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service
            .start_execution(&link, schedules_file, schedule_index)
            .await;
        self.commit(service, &original, result).await
    }

    pub async fn sampling_results(&self, ctx: &CallerContext) -> Result<Vec<SamplingResult>> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.fetch_sampling_results(&link).await;
        self.commit(service, &original, result).await
    }

    pub async fn progress(
        &self,
        ctx: &CallerContext,
    ) -> Result<RemoteStatus<ExecutionProgress>> {
        let (mut service, original) = self.checkout(ctx).await?;
        let link = service.link(&self.rpc, self.settings.timeouts)?;
        let result = service.fetch_progress(&link).await;
        self.commit(service, &original, result).await
    }
}
