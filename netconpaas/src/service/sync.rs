use std::time::Duration;

use serde_json::{json, Value};
use time::OffsetDateTime;

use super::{
    generic::parse_result,
    state::LifecycleEvent,
    variant::{Operation, ServiceVariant},
    ManagerLink, Service,
};
use crate::{
    entity::state::{LifecycleState, RemotePhase},
    error::{Error, Result},
    schema::{CachedRemoteState, NodeInfoResp, NodeLists, RemoteStatus, ServiceInfo},
};

impl Service {
    /// Reads `get_service_info`. A `null` result means the manager has no
    /// service state to report yet.
    pub async fn fetch_service_info(
        &mut self,
        link: &ManagerLink<'_>,
    ) -> Result<RemoteStatus<ServiceInfo>> {
        let value = link
            .call(&self.variant, Operation::FetchState, json!({}))
            .await?;
        if value.is_null() {
            return Ok(RemoteStatus::Unavailable);
        }
        let info: ServiceInfo = parse_result(&self.variant, Operation::FetchState, value.clone())?;
        self.cached_state = Some(CachedRemoteState::new(value));
        Ok(RemoteStatus::Available(info))
    }

    /// Rebuilds the node registry from `list_nodes`, then fills in addresses
    /// node by node. Missing details do not fail the refresh.
    pub async fn refresh_nodes(&mut self, link: &ManagerLink<'_>) -> Result<()> {
        let value = link
            .call(&self.variant, Operation::ListNodes, json!({}))
            .await?;
        let lists: NodeLists = match value {
            Value::Null => NodeLists::default(),
            other => parse_result(&self.variant, Operation::ListNodes, other)?,
        };
        self.nodes.refresh_from_remote(lists);
        let ids: Vec<String> = self.nodes.iter().map(|n| n.node_id.clone()).collect();
        for id in ids {
            let info = link
                .call(
                    &self.variant,
                    Operation::GetNodeInfo,
                    json!({"serviceNodeId": id}),
                )
                .await
                .and_then(|v| parse_result::<NodeInfoResp>(&self.variant, Operation::GetNodeInfo, v));
            match info {
                Ok(resp) => self.nodes.apply_node_info(resp.service_node),
                Err(e) => tracing::debug!("no details for node {}: {}", id, e),
            }
        }
        Ok(())
    }

    /// One reconciliation round against the manager, advancing the lifecycle
    /// from what it reports. Only STARTING, RUNNING and STOPPING talk to the
    /// manager; the other states wait on the provisioning layer or the user.
    pub async fn sync_with_manager(
        &mut self,
        link: &ManagerLink<'_>,
        stop_timeout: Duration,
    ) -> Result<()> {
        match self.lifecycle_state {
            LifecycleState::Starting | LifecycleState::Running => {}
            LifecycleState::Stopping => return self.sync_stopping(link, stop_timeout).await,
            LifecycleState::Init | LifecycleState::Stopped | LifecycleState::Error => {
                return Ok(())
            }
        }
        if matches!(self.variant, ServiceVariant::TaskFarm(_)) {
            if let RemoteStatus::Available(_) = self.fetch_progress(link).await? {
                self.apply(LifecycleEvent::NodesReported { complete: true })?;
            }
            return Ok(());
        }

        let RemoteStatus::Available(info) = self.fetch_service_info(link).await? else {
            return Ok(());
        };
        match RemotePhase::from(info.state.as_str()) {
            RemotePhase::Running => {}
            RemotePhase::Failed => {
                self.apply(LifecycleEvent::Unrecoverable)?;
                return Ok(());
            }
            phase => {
                tracing::debug!("service {} manager reports {:?}", self.service_id, phase);
                return Ok(());
            }
        }
        self.refresh_nodes(link).await?;
        let complete = self.nodes.has_roles(self.variant.instance_roles());
        self.apply(LifecycleEvent::NodesReported { complete })?;

        if self.lifecycle_state == LifecycleState::Running
            && matches!(self.variant, ServiceVariant::Generic(_))
        {
            self.update_script_status(link).await?;
            self.list_code_versions(link).await?;
        }
        Ok(())
    }

    fn stop_deadline_passed(&self, stop_timeout: Duration) -> bool {
        self.stopping_since
            .is_some_and(|since| OffsetDateTime::now_utc() - since >= stop_timeout)
    }

    /// While stopping, silence from the manager is the confirmation: it either
    /// reports STOPPED, has nothing left to report, or is gone already.
    async fn sync_stopping(&mut self, link: &ManagerLink<'_>, stop_timeout: Duration) -> Result<()> {
        if self.stop_deadline_passed(stop_timeout) {
            self.apply(LifecycleEvent::ShutdownTimedOut)?;
            return Ok(());
        }
        let stopped = if matches!(self.variant, ServiceVariant::TaskFarm(_)) {
            match self.fetch_progress(link).await {
                Ok(RemoteStatus::Available(_)) => false,
                Ok(RemoteStatus::Unavailable) => true,
                Err(Error::Transport { .. }) => true,
                Err(e) => return Err(e),
            }
        } else {
            match self.fetch_service_info(link).await {
                Ok(RemoteStatus::Available(info)) => {
                    RemotePhase::from(info.state.as_str()) == RemotePhase::Stopped
                }
                Ok(RemoteStatus::Unavailable) => true,
                Err(Error::Transport { .. }) => true,
                Err(e) => return Err(e),
            }
        };
        if stopped {
            self.apply(LifecycleEvent::ShutdownConfirmed)?;
        }
        Ok(())
    }
}
