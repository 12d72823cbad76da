use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::{
    variant::{GenericState, Operation, ServiceVariant},
    ManagerLink, Service,
};
use crate::{
    entity::state::ScriptCommand,
    error::{Error, Result},
    rpc::Upload,
    schema::{CodeVersion, CodeVersionList, ScriptStatus, ScriptStatusResp, Volume, VolumeList},
};

impl Service {
    fn generic_mut(&mut self, operation: Operation) -> Result<&mut GenericState> {
        let kind = self.kind();
        match &mut self.variant {
            ServiceVariant::Generic(state) => Ok(state),
            _ => Err(Error::UnsupportedOperation { operation, kind }),
        }
    }

    /// Starts one of the lifecycle scripts on every agent.
    pub async fn execute_script(
        &mut self,
        link: &ManagerLink<'_>,
        command: ScriptCommand,
        parameters: String,
    ) -> Result<Value> {
        self.generic_mut(Operation::ExecuteScript)?;
        self.require_running(Operation::ExecuteScript)?;
        let params = json!({"command": command.to_string(), "parameters": parameters});
        let result = link
            .call(&self.variant, Operation::ExecuteScript, params)
            .await?;
        tracing::info!("service {} executed {} script", self.service_id, command);
        self.invalidate_cache();
        Ok(result)
    }

    /// Refreshes the per node script status.
    ///
    /// Outside RUNNING there is nothing to ask and the status is cleared. The
    /// status call is best effort: an explicit error from the manager, or an
    /// empty answer, also clears the status instead of failing. Transport
    /// failures are still reported so a poller can back off.
    pub async fn update_script_status(
        &mut self,
        link: &ManagerLink<'_>,
    ) -> Result<Option<BTreeMap<String, ScriptStatus>>> {
        self.generic_mut(Operation::GetScriptStatus)?;
        if self.require_running(Operation::GetScriptStatus).is_err() {
            self.generic_mut(Operation::GetScriptStatus)?.script_status = None;
            return Ok(None);
        }
        let status = match link
            .call(&self.variant, Operation::GetScriptStatus, json!({}))
            .await
        {
            Ok(Value::Null) => None,
            Ok(value) => match serde_json::from_value::<ScriptStatusResp>(value) {
                Ok(resp) => Some(resp.agents),
                Err(e) => {
                    tracing::warn!("ignoring unreadable script status: {}", e);
                    None
                }
            },
            Err(Error::Remote { message, .. }) => {
                tracing::warn!(
                    "script status of service {} unavailable: {}",
                    self.service_id,
                    message
                );
                None
            }
            Err(e) => return Err(e),
        };
        self.generic_mut(Operation::GetScriptStatus)?.script_status = status.clone();
        Ok(status)
    }

    /// Fetches the flat volume list and hangs each volume off its node.
    /// Returns the volumes that were kept.
    pub async fn update_volumes(&mut self, link: &ManagerLink<'_>) -> Result<Vec<Volume>> {
        self.generic_mut(Operation::ListVolumes)?;
        self.require_running(Operation::ListVolumes)?;
        let value = link
            .call(&self.variant, Operation::ListVolumes, json!({}))
            .await?;
        let list: VolumeList = parse_result(&self.variant, Operation::ListVolumes, value)?;
        let dropped = self.nodes.assign_volumes(list.volumes);
        if dropped > 0 {
            tracing::debug!(
                "service {} has {} volumes on departed nodes",
                self.service_id,
                dropped
            );
        }
        Ok(self.nodes.iter().flat_map(|n| n.volumes.clone()).collect())
    }

    pub async fn create_volume(
        &mut self,
        link: &ManagerLink<'_>,
        name: String,
        size_mb: u64,
        agent_id: String,
    ) -> Result<Value> {
        self.generic_mut(Operation::CreateVolume)?;
        self.require_running(Operation::CreateVolume)?;
        self.nodes.get_node(&agent_id)?;
        let params = json!({"volumeName": name, "volumeSize": size_mb, "agentId": agent_id});
        let result = link
            .call(&self.variant, Operation::CreateVolume, params)
            .await?;
        tracing::info!("service {} created volume {}", self.service_id, name);
        self.invalidate_cache();
        Ok(result)
    }

    pub async fn delete_volume(&mut self, link: &ManagerLink<'_>, name: String) -> Result<Value> {
        self.generic_mut(Operation::DeleteVolume)?;
        self.require_running(Operation::DeleteVolume)?;
        let result = link
            .call(
                &self.variant,
                Operation::DeleteVolume,
                json!({"volumeName": name}),
            )
            .await?;
        tracing::info!("service {} deleted volume {}", self.service_id, name);
        self.nodes.remove_volume(&name);
        self.invalidate_cache();
        Ok(result)
    }

    pub async fn list_code_versions(&mut self, link: &ManagerLink<'_>) -> Result<Vec<CodeVersion>> {
        self.generic_mut(Operation::ListCodeVersions)?;
        let value = link
            .call(&self.variant, Operation::ListCodeVersions, json!({}))
            .await?;
        let mut list: CodeVersionList = parse_result(&self.variant, Operation::ListCodeVersions, value)?;
        // At most one version may be current; trust the first one the manager flags
        let mut seen_current = false;
        for version in list.code_versions.iter_mut() {
            if version.current && seen_current {
                version.current = false;
            }
            seen_current |= version.current;
        }
        self.generic_mut(Operation::ListCodeVersions)?.code_versions = list.code_versions.clone();
        Ok(list.code_versions)
    }

    pub async fn upload_code_version(
        &mut self,
        link: &ManagerLink<'_>,
        file_name: String,
        content: Vec<u8>,
        description: String,
    ) -> Result<Value> {
        self.generic_mut(Operation::UploadCodeVersion)?;
        let upload = Upload {
            field: "code",
            file_name,
            content,
        };
        let result = link
            .upload(
                &self.variant,
                Operation::UploadCodeVersion,
                vec![("description", description)],
                upload,
            )
            .await?;
        self.invalidate_cache();
        Ok(result)
    }

    /// Makes `version_id` the active code version.
    pub async fn enable_code(&mut self, link: &ManagerLink<'_>, version_id: String) -> Result<Value> {
        self.generic_mut(Operation::SendConfiguration)?;
        let result = link
            .call(
                &self.variant,
                Operation::SendConfiguration,
                json!({"codeVersionId": version_id}),
            )
            .await?;
        tracing::info!("service {} enabled code {}", self.service_id, version_id);
        let state = self.generic_mut(Operation::SendConfiguration)?;
        for version in state.code_versions.iter_mut() {
            version.current = version.version_id == version_id;
        }
        self.invalidate_cache();
        Ok(result)
    }

    pub async fn delete_code_version(
        &mut self,
        link: &ManagerLink<'_>,
        version_id: String,
    ) -> Result<Value> {
        let state = self.generic_mut(Operation::DeleteCodeVersion)?;
        if state
            .code_versions
            .iter()
            .any(|v| v.current && v.version_id == version_id)
        {
            return Err(Error::Conflict(format!(
                "code version {version_id} is currently enabled"
            )));
        }
        let result = link
            .call(
                &self.variant,
                Operation::DeleteCodeVersion,
                json!({"codeVersionId": version_id}),
            )
            .await?;
        self.generic_mut(Operation::DeleteCodeVersion)?
            .code_versions
            .retain(|v| v.version_id != version_id);
        self.invalidate_cache();
        Ok(result)
    }
}

/// Decodes a `result` payload, reporting a shape mismatch as a malformed
/// response of the method behind `operation`.
pub(crate) fn parse_result<T: serde::de::DeserializeOwned>(
    variant: &ServiceVariant,
    operation: Operation,
    value: Value,
) -> Result<T> {
    let method = variant.rpc_method(operation)?;
    let body = value.to_string();
    serde_json::from_value(value).map_err(|_| Error::MalformedResponse {
        method: method.name.to_string(),
        body,
        idempotent: method.idempotent,
    })
}
