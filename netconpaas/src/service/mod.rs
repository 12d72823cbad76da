pub mod generic;
pub mod node;
pub mod state;
pub mod sync;
pub mod taskfarm;
pub mod variant;

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use url::Url;

use crate::{
    entity::state::{LifecycleState, ServiceKind},
    error::{Error, Result},
    rpc::{Endpoint, RpcClient, Upload},
    schema::{CachedRemoteState, NodeSummary, RoleGroup, ServiceSummary, TaskFarmSummary},
};
use node::NodeRegistry;
use state::{transition, LifecycleEvent};
use variant::{Operation, ServiceVariant};

pub fn name_validator(name: &str) -> bool {
    let l = name.len();
    l > 0
        && l < 256
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == ' ')
}

/// Per call deadlines. Status fetches must fail fast while actions such as
/// script execution may legitimately take minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub status: Duration,
    pub action: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            status: Duration::from_secs(10),
            action: Duration::from_secs(600),
        }
    }
}

/// A connection to one manager, valid for a single unit of work.
pub struct ManagerLink<'a> {
    pub rpc: &'a RpcClient,
    pub endpoint: Endpoint,
    pub timeouts: Timeouts,
}

impl ManagerLink<'_> {
    /// Calls the method backing `operation` on `variant`, with the status
    /// deadline for idempotent methods and the action deadline otherwise.
    pub async fn call(
        &self,
        variant: &ServiceVariant,
        operation: Operation,
        params: Value,
    ) -> Result<Value> {
        self.call_inner(variant, operation, params, true).await
    }

    /// Like [`ManagerLink::call`] but a reply without `result` is accepted.
    pub async fn probe(
        &self,
        variant: &ServiceVariant,
        operation: Operation,
        params: Value,
    ) -> Result<Value> {
        self.call_inner(variant, operation, params, false).await
    }

    async fn call_inner(
        &self,
        variant: &ServiceVariant,
        operation: Operation,
        params: Value,
        expect_result: bool,
    ) -> Result<Value> {
        let method = variant.rpc_method(operation)?;
        let timeout = if method.idempotent {
            self.timeouts.status
        } else {
            self.timeouts.action
        };
        self.rpc
            .call(&self.endpoint, &method, &params, expect_result, timeout)
            .await
            .map_err(|e| Error::from_rpc(&method, e))
    }

    pub async fn upload(
        &self,
        variant: &ServiceVariant,
        operation: Operation,
        fields: Vec<(&'static str, String)>,
        upload: Upload,
    ) -> Result<Value> {
        let method = variant.rpc_method(operation)?;
        self.rpc
            .upload(&self.endpoint, &method, fields, upload, self.timeouts.action)
            .await
            .map_err(|e| Error::from_rpc(&method, e))
    }
}

/// A user owned service as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub service_id: u64,
    pub owner_id: String,
    pub name: String,
    /// Identifier the manager uses for this service in its RPC envelope
    pub manager_service_id: u64,
    #[serde(default)]
    pub manager_address: Option<String>,
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub cached_state: Option<CachedRemoteState>,
    #[serde(default)]
    pub nodes: NodeRegistry,
    pub variant: ServiceVariant,
    #[serde(default)]
    pub stopping_since: Option<OffsetDateTime>,
    /// Transitions applied since the record was loaded
    #[serde(skip)]
    pub(crate) applied_events: Vec<LifecycleEvent>,
}

/// Fields to overwrite in a stored record. Untouched fields stay as another
/// caller may have written them.
///
/// `base_state` is the lifecycle state the fields were derived from and
/// `events` the transitions applied on top of it. When the stored record has
/// moved on in the meantime the events are replayed against the stored state:
/// a write that still follows the transition table lands on the replayed
/// state, anything else is dropped whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub manager_address: Option<Option<String>>,
    pub lifecycle_state: Option<LifecycleState>,
    pub cached_state: Option<Option<CachedRemoteState>>,
    pub nodes: Option<NodeRegistry>,
    pub variant: Option<ServiceVariant>,
    pub stopping_since: Option<Option<OffsetDateTime>>,
    pub base_state: Option<LifecycleState>,
    pub events: Vec<LifecycleEvent>,
    /// Refuse the write instead of replaying when the stored state differs
    /// from `base_state`.
    pub exclusive: bool,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.manager_address.is_none()
            && self.lifecycle_state.is_none()
            && self.cached_state.is_none()
            && self.nodes.is_none()
            && self.variant.is_none()
            && self.stopping_since.is_none()
    }

    /// Only lands when the stored state still equals the base state.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Writes the patch into `service`. Returns `false` when the patch was
    /// dropped as stale.
    pub fn apply(mut self, service: &mut Service) -> Result<bool> {
        if let Some(base) = self.base_state {
            let stored = service.lifecycle_state;
            if stored != base {
                if self.exclusive {
                    return Err(Error::Conflict(format!(
                        "service {} moved from {} to {} concurrently",
                        service.service_id, base, stored
                    )));
                }
                let replayed = self
                    .events
                    .iter()
                    .try_fold(stored, |state, event| transition(state, *event));
                match replayed {
                    Ok(state) => {
                        tracing::debug!(
                            "service {} replayed {} event(s) over {}",
                            service.service_id,
                            self.events.len(),
                            stored
                        );
                        self.lifecycle_state = (state != stored).then_some(state);
                    }
                    Err(e) => {
                        tracing::debug!(
                            "service {} dropped stale write based on {}: {}",
                            service.service_id,
                            base,
                            e
                        );
                        return Ok(false);
                    }
                }
            }
        }
        if let Some(address) = self.manager_address {
            service.manager_address = address;
        }
        if let Some(state) = self.lifecycle_state {
            service.lifecycle_state = state;
        }
        if let Some(cached) = self.cached_state {
            service.cached_state = cached;
        }
        if let Some(nodes) = self.nodes {
            service.nodes = nodes;
        }
        if let Some(variant) = self.variant {
            service.variant = variant;
        }
        if let Some(since) = self.stopping_since {
            service.stopping_since = since;
        }
        Ok(true)
    }
}

impl Service {
    pub fn new(owner_id: String, name: String, kind: ServiceKind) -> Self {
        Self {
            service_id: 0,
            owner_id,
            name,
            manager_service_id: 0,
            manager_address: None,
            lifecycle_state: LifecycleState::Init,
            cached_state: None,
            nodes: NodeRegistry::default(),
            variant: ServiceVariant::new(kind),
            stopping_since: None,
            applied_events: Vec::new(),
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.variant.kind()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle_state
    }

    pub fn needs_polling(&self) -> bool {
        self.variant.needs_polling(self.lifecycle_state)
    }

    pub fn is_stable(&self) -> bool {
        self.variant.is_stable(self.lifecycle_state)
    }

    pub fn cached_state(&self) -> Option<&CachedRemoteState> {
        self.cached_state.as_ref()
    }

    /// Applies a lifecycle event and reports whether the state changed.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<bool> {
        let from = self.lifecycle_state;
        let to = transition(from, event)?;
        self.applied_events.push(event);
        if from != to {
            tracing::info!("service {} {} -> {} on {}", self.service_id, from, to, event);
            self.lifecycle_state = to;
            match to {
                LifecycleState::Init => self.forget_remote_view(),
                LifecycleState::Stopping => self.stopping_since = Some(OffsetDateTime::now_utc()),
                _ => {}
            }
        }
        Ok(from != to)
    }

    /// Called after any mutating call succeeds.
    pub fn invalidate_cache(&mut self) {
        self.cached_state = None;
    }

    fn forget_remote_view(&mut self) {
        self.nodes.clear();
        self.cached_state = None;
        self.stopping_since = None;
        self.variant.reset_remote_view();
    }

    pub fn require_running(&self, operation: Operation) -> Result<()> {
        if self.lifecycle_state == LifecycleState::Running {
            Ok(())
        } else {
            Err(Error::Conflict(format!(
                "cannot {operation} while service {} is {}",
                self.service_id, self.lifecycle_state
            )))
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        let address = self.manager_address.as_deref().ok_or_else(|| {
            Error::Conflict(format!(
                "manager of service {} is not resolved yet",
                self.service_id
            ))
        })?;
        let url = Url::parse(&self.variant.transport().endpoint(address))
            .map_err(|e| Error::Custom(format!("invalid manager address {address}: {e}")))?;
        Ok(Endpoint::new(url, self.manager_service_id))
    }

    pub fn link<'a>(&self, rpc: &'a RpcClient, timeouts: Timeouts) -> Result<ManagerLink<'a>> {
        Ok(ManagerLink {
            rpc,
            endpoint: self.endpoint()?,
            timeouts,
        })
    }

    /// Fields that differ from `original`, ready to be saved.
    pub fn diff(&self, original: &Service) -> RecordPatch {
        RecordPatch {
            manager_address: (self.manager_address != original.manager_address)
                .then(|| self.manager_address.clone()),
            lifecycle_state: (self.lifecycle_state != original.lifecycle_state)
                .then_some(self.lifecycle_state),
            cached_state: (self.cached_state != original.cached_state)
                .then(|| self.cached_state.clone()),
            nodes: (self.nodes != original.nodes).then(|| self.nodes.clone()),
            variant: (self.variant != original.variant).then(|| self.variant.clone()),
            stopping_since: (self.stopping_since != original.stopping_since)
                .then_some(self.stopping_since),
            base_state: Some(original.lifecycle_state),
            events: self
                .applied_events
                .iter()
                .skip(original.applied_events.len())
                .copied()
                .collect(),
            exclusive: false,
        }
    }

    /// Pushes configuration to the manager. For generic services this enables
    /// a code version; HTC managers have nothing to configure.
    pub async fn send_configuration(
        &mut self,
        link: &ManagerLink<'_>,
        code_version: Option<String>,
    ) -> Result<Value> {
        match (self.kind(), code_version) {
            (ServiceKind::Htc, _) => Ok(Value::Bool(true)),
            (ServiceKind::Generic, Some(version_id)) => self.enable_code(link, version_id).await,
            (ServiceKind::Generic, None) => Err(Error::Custom(
                "a code version is required to configure a generic service".to_string(),
            )),
            (kind @ ServiceKind::TaskFarm, _) => Err(Error::UnsupportedOperation {
                operation: Operation::SendConfiguration,
                kind,
            }),
        }
    }

    pub fn access_location(&self) -> Option<String> {
        let agent_ip = self
            .nodes
            .nodes_in_role("agent")
            .find_map(|n| n.ip_address.as_deref());
        self.variant.access_location(agent_ip)
    }

    fn node_summaries(&self) -> BTreeMap<String, Vec<NodeSummary>> {
        let script_status = match &self.variant {
            ServiceVariant::Generic(state) => state.script_status.as_ref(),
            _ => None,
        };
        self.nodes
            .by_role()
            .keys()
            .map(|role| {
                let nodes = self
                    .nodes
                    .nodes_in_role(role)
                    .map(|n| n.to_summary(script_status.and_then(|s| s.get(&n.node_id))))
                    .collect();
                (role.clone(), nodes)
            })
            .collect()
    }

    /// Nodes grouped under their display style. Fails for a role the style
    /// table does not know.
    pub fn role_groups(&self) -> Result<Vec<RoleGroup>> {
        let mut summaries = self.node_summaries();
        self.nodes
            .role_styles()?
            .into_iter()
            .map(|style| {
                let nodes = summaries.remove(style.role).unwrap_or_default();
                Ok(RoleGroup { style, nodes })
            })
            .collect()
    }

    pub fn to_summary(&self) -> ServiceSummary {
        let taskfarm = match &self.variant {
            ServiceVariant::TaskFarm(state) => {
                let progress = state.progress.unwrap_or_default();
                Some(TaskFarmSummary {
                    mode: state.mode,
                    money_spent: progress.money_spent,
                    completed_tasks: progress.completed_tasks,
                    total_tasks: progress.total_tasks,
                })
            }
            _ => None,
        };
        let current_code_version = match &self.variant {
            ServiceVariant::Generic(state) => state
                .code_versions
                .iter()
                .find(|v| v.current)
                .map(|v| v.version_id.clone()),
            _ => None,
        };
        ServiceSummary {
            service_id: self.service_id,
            name: self.name.clone(),
            kind: self.kind(),
            lifecycle_state: self.lifecycle_state,
            manager_address: self.manager_address.clone(),
            needs_polling: self.needs_polling(),
            access_location: self.access_location(),
            nodes: self.node_summaries(),
            taskfarm,
            current_code_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_generic() -> Service {
        let mut service = Service::new("alice".into(), "web".into(), ServiceKind::Generic);
        service.service_id = 3;
        service.manager_address = Some("10.0.0.2".into());
        service.lifecycle_state = LifecycleState::Running;
        service.cached_state = Some(CachedRemoteState::new(json!({"state": "RUNNING"})));
        service
            .nodes
            .refresh_from_remote(serde_json::from_value(json!({"master": [1], "node": [2]})).unwrap());
        service
    }

    #[test]
    fn test_manager_moved_clears_remote_view() {
        let mut service = running_generic();
        assert!(service.apply(LifecycleEvent::ManagerMoved).unwrap());
        assert_eq!(service.lifecycle_state(), LifecycleState::Init);
        assert!(service.nodes.is_empty());
        assert!(service.cached_state().is_none());
        assert!(service.needs_polling());
    }

    #[test]
    fn test_diff_only_carries_changes() {
        let original = running_generic();
        let mut changed = original.clone();
        assert!(changed.diff(&original).is_empty());

        changed.invalidate_cache();
        let patch = changed.diff(&original);
        assert_eq!(patch.cached_state, Some(None));
        assert!(patch.nodes.is_none());
        assert!(patch.lifecycle_state.is_none());

        let mut restored = original.clone();
        assert!(patch.apply(&mut restored).unwrap());
        assert_eq!(restored, changed);
    }

    #[test]
    fn test_stale_write_replays_over_stored_state() {
        let loaded = Service::new("alice".into(), "web".into(), ServiceKind::Generic);
        let mut refreshed = loaded.clone();
        refreshed.manager_address = Some("10.0.0.2".into());
        refreshed.apply(LifecycleEvent::AddressResolved).unwrap();
        refreshed
            .apply(LifecycleEvent::NodesReported { complete: true })
            .unwrap();
        refreshed
            .nodes
            .refresh_from_remote(serde_json::from_value(json!({"master": [1]})).unwrap());
        let patch = refreshed.diff(&loaded);
        assert_eq!(patch.lifecycle_state, Some(LifecycleState::Running));

        // Terminated while the refresh was in flight
        let mut stored = loaded.clone();
        stored.manager_address = Some("10.0.0.2".into());
        stored.lifecycle_state = LifecycleState::Stopping;
        stored.stopping_since = Some(OffsetDateTime::now_utc());

        assert!(patch.apply(&mut stored).unwrap());
        assert_eq!(stored.lifecycle_state(), LifecycleState::Stopping);
        assert!(stored.stopping_since.is_some());
        assert_eq!(stored.nodes.len(), 1);
    }

    #[test]
    fn test_stale_write_with_invalid_replay_is_dropped() {
        let mut loaded = running_generic();
        loaded.lifecycle_state = LifecycleState::Error;
        let mut recovered = loaded.clone();
        recovered.apply(LifecycleEvent::Recover).unwrap();
        recovered.invalidate_cache();
        let patch = recovered.diff(&loaded);

        let mut stored = loaded.clone();
        stored.lifecycle_state = LifecycleState::Stopping;
        assert!(!patch.apply(&mut stored).unwrap());
        assert_eq!(stored.lifecycle_state(), LifecycleState::Stopping);
        assert!(stored.cached_state().is_some());
    }

    #[test]
    fn test_exclusive_write_conflicts_on_moved_state() {
        let loaded = running_generic();
        let mut first = loaded.clone();
        first.apply(LifecycleEvent::TerminateRequested).unwrap();
        let mut second = first.clone();
        second.applied_events.clear();

        let mut stored = loaded.clone();
        assert!(first.diff(&loaded).exclusive().apply(&mut stored).unwrap());
        assert_eq!(stored.lifecycle_state(), LifecycleState::Stopping);
        let err = second.diff(&loaded).exclusive().apply(&mut stored).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_endpoint_per_transport() {
        let service = running_generic();
        assert_eq!(
            service.endpoint().unwrap().url.as_str(),
            "https://10.0.0.2/"
        );
        let mut farm = Service::new("alice".into(), "farm".into(), ServiceKind::TaskFarm);
        farm.manager_address = Some("10.0.0.9".into());
        assert_eq!(farm.endpoint().unwrap().url.as_str(), "http://10.0.0.9:8475/");
        farm.manager_address = None;
        assert!(matches!(farm.endpoint(), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_summary_projection() {
        let service = running_generic();
        let summary = service.to_summary();
        assert_eq!(summary.kind, ServiceKind::Generic);
        assert!(!summary.needs_polling);
        assert_eq!(summary.nodes["master"].len(), 1);
        assert_eq!(summary.nodes["node"][0].node_id, "2");
        assert!(summary.taskfarm.is_none());
        let groups = service.role_groups().unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_operations_require_running() {
        let mut service = running_generic();
        assert!(service.require_running(Operation::ExecuteScript).is_ok());
        service.apply(LifecycleEvent::TerminateRequested).unwrap();
        assert!(service.stopping_since.is_some());
        assert!(matches!(
            service.require_running(Operation::ExecuteScript),
            Err(Error::Conflict(_))
        ));
    }
}
