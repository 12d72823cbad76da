use serde_json::{json, Value};

use super::{
    generic::parse_result,
    variant::{Operation, ServiceVariant, TaskFarmState},
    ManagerLink, Service,
};
use crate::{
    entity::state::TaskFarmMode,
    error::{Error, Result},
    schema::{CachedRemoteState, ExecutionProgress, RemoteStatus, SamplingResult},
};

impl Service {
    fn taskfarm_mut(&mut self, operation: Operation) -> Result<&mut TaskFarmState> {
        let kind = self.kind();
        match &mut self.variant {
            ServiceVariant::TaskFarm(state) => Ok(state),
            _ => Err(Error::UnsupportedOperation { operation, kind }),
        }
    }

    /// Reads mode and progress counters from the manager and caches them.
    pub async fn fetch_progress(
        &mut self,
        link: &ManagerLink<'_>,
    ) -> Result<RemoteStatus<ExecutionProgress>> {
        self.taskfarm_mut(Operation::FetchState)?;
        let value = link
            .call(&self.variant, Operation::FetchState, json!([]))
            .await?;
        if value.is_null() {
            return Ok(RemoteStatus::Unavailable);
        }
        let progress: ExecutionProgress =
            parse_result(&self.variant, Operation::FetchState, value.clone())?;
        let state = self.taskfarm_mut(Operation::FetchState)?;
        state.mode = progress.mode;
        state.progress = Some(progress);
        self.cached_state = Some(CachedRemoteState::new(value));
        Ok(RemoteStatus::Available(progress))
    }

    /// Re-reads the counters from the manager and refuses to go on while an
    /// execution is in flight. Local caches are not shared between callers,
    /// so the check always uses what the manager reports right now.
    async fn ensure_no_execution(
        &mut self,
        link: &ManagerLink<'_>,
        operation: Operation,
    ) -> Result<()> {
        match self.fetch_progress(link).await? {
            RemoteStatus::Available(progress) if progress.in_flight() => Err(Error::Conflict(
                format!(
                    "cannot {operation}: execution in progress ({}/{} tasks done)",
                    progress.completed_tasks, progress.total_tasks
                ),
            )),
            RemoteStatus::Available(_) => Ok(()),
            RemoteStatus::Unavailable => Err(Error::Conflict(format!(
                "cannot {operation}: manager reports no service state"
            ))),
        }
    }

    pub async fn set_mode(&mut self, link: &ManagerLink<'_>, mode: TaskFarmMode) -> Result<Value> {
        self.taskfarm_mut(Operation::SetMode)?;
        if mode == TaskFarmMode::NotSet {
            return Err(Error::Custom("mode must be DEMO or REAL".to_string()));
        }
        self.ensure_no_execution(link, Operation::SetMode).await?;
        let result = link
            .call(&self.variant, Operation::SetMode, json!([mode.as_wire()]))
            .await?;
        tracing::info!("service {} switched to {} mode", self.service_id, mode);
        self.taskfarm_mut(Operation::SetMode)?.mode = mode;
        self.invalidate_cache();
        Ok(result)
    }

    /// Starts a batch execution with schedule `schedule_index` of the sampling
    /// results in `schedules_file`.
    pub async fn start_execution(
        &mut self,
        link: &ManagerLink<'_>,
        schedules_file: String,
        schedule_index: u32,
    ) -> Result<Value> {
        self.taskfarm_mut(Operation::StartExecution)?;
        self.ensure_no_execution(link, Operation::StartExecution)
            .await?;
        if self.taskfarm_mut(Operation::StartExecution)?.mode == TaskFarmMode::NotSet {
            return Err(Error::Conflict(
                "cannot start execution before a mode is set".to_string(),
            ));
        }
        let method = self.variant.rpc_method(Operation::StartExecution)?;
        let result = link
            .call(
                &self.variant,
                Operation::StartExecution,
                json!([schedules_file, schedule_index]),
            )
            .await?;
        // Some managers report failure inside a successful envelope
        if let Some(error) = result.get("error").filter(|e| !e.is_null()) {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            return Err(Error::Remote {
                method: method.name.to_string(),
                code: None,
                message,
                idempotent: false,
            });
        }
        tracing::info!(
            "service {} started execution of schedule {} from {}",
            self.service_id,
            schedule_index,
            schedules_file
        );
        self.invalidate_cache();
        Ok(result)
    }

    /// Sampling results so far. No samples yet is an empty list, not an error.
    pub async fn fetch_sampling_results(
        &mut self,
        link: &ManagerLink<'_>,
    ) -> Result<Vec<SamplingResult>> {
        self.taskfarm_mut(Operation::GetSamplingResults)?;
        let value = link
            .call(&self.variant, Operation::GetSamplingResults, json!([]))
            .await?;
        let value = match value {
            // The manager double encodes the list as a JSON string
            Value::String(s) if s.trim().is_empty() => Value::Null,
            Value::String(s) => serde_json::from_str(&s).map_err(|_| Error::MalformedResponse {
                method: "get_sampling_results".to_string(),
                body: s.clone(),
                idempotent: true,
            })?,
            other => other,
        };
        let results: Vec<SamplingResult> = match value {
            Value::Null => Vec::new(),
            Value::Array(items) if items.is_empty() => Vec::new(),
            Value::Object(obj) if obj.is_empty() => Vec::new(),
            Value::Object(obj) => vec![parse_result(
                &self.variant,
                Operation::GetSamplingResults,
                Value::Object(obj),
            )?],
            other => parse_result(&self.variant, Operation::GetSamplingResults, other)?,
        };
        self.taskfarm_mut(Operation::GetSamplingResults)?.sampling_results = results.clone();
        Ok(results)
    }

    pub async fn terminate_workers(&mut self, link: &ManagerLink<'_>) -> Result<()> {
        self.taskfarm_mut(Operation::TerminateWorkers)?;
        link.probe(&self.variant, Operation::TerminateWorkers, json!([]))
            .await?;
        self.invalidate_cache();
        Ok(())
    }
}
