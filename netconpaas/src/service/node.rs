use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    entity::role::{role_style, RoleStyle},
    error::{Error, Result},
    schema::{NodeInfo, NodeLists, NodeSummary, ScriptStatus, Volume},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub node_id: String,
    pub role: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub cloud_provider: Option<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl Node {
    fn new(node_id: String, role: String) -> Self {
        Self {
            node_id,
            role,
            ip_address: None,
            cloud_provider: None,
            volumes: Vec::new(),
        }
    }

    pub fn to_summary(&self, script_status: Option<&ScriptStatus>) -> NodeSummary {
        NodeSummary {
            node_id: self.node_id.clone(),
            role: self.role.clone(),
            ip_address: self.ip_address.clone(),
            cloud_provider: self.cloud_provider.clone(),
            volumes: self.volumes.clone(),
            script_status: script_status.cloned(),
        }
    }
}

/// Nodes of one service, grouped by role in the order the manager listed them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRegistry {
    by_role: BTreeMap<String, Vec<String>>,
    nodes: BTreeMap<String, Node>,
}

impl NodeRegistry {
    /// Replaces the whole registry with what the manager reported. Nothing
    /// survives from the previous generation, so nodes that vanished remotely
    /// vanish here too.
    pub fn refresh_from_remote(&mut self, lists: NodeLists) {
        let mut by_role: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut nodes = BTreeMap::new();
        for (role, ids) in lists.into_ids() {
            let entry = by_role.entry(role.clone()).or_default();
            for id in ids {
                if let Some(existing) = nodes.get(&id).map(|n: &Node| n.role.clone()) {
                    if existing != role {
                        tracing::warn!(
                            "node {} reported as both {} and {}, keeping {}",
                            id,
                            existing,
                            role,
                            existing
                        );
                    }
                    continue;
                }
                entry.push(id.clone());
                nodes.insert(id.clone(), Node::new(id, role.clone()));
            }
        }
        self.by_role = by_role;
        self.nodes = nodes;
    }

    pub fn get_node(&self, node_id: &str) -> Result<&Node> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))
    }

    pub fn clear(&mut self) {
        self.by_role.clear();
        self.nodes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when every role in `roles` holds at least one node.
    pub fn has_roles(&self, roles: &[&str]) -> bool {
        roles
            .iter()
            .all(|role| self.by_role.get(*role).is_some_and(|ids| !ids.is_empty()))
    }

    pub fn by_role(&self) -> &BTreeMap<String, Vec<String>> {
        &self.by_role
    }

    pub fn nodes_in_role<'a>(&'a self, role: &str) -> impl Iterator<Item = &'a Node> + 'a {
        self.by_role
            .get(role)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.by_role
            .values()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    /// Fills in address details from `get_node_info`. Unknown ids are ignored.
    pub fn apply_node_info(&mut self, info: NodeInfo) {
        if let Some(node) = self.nodes.get_mut(&info.id) {
            node.ip_address = info.ip;
            node.cloud_provider = info.cloud;
        }
    }

    /// Distributes a flat volume list over the nodes. The list is sorted by
    /// name first. Volumes attached to a node this registry does not know are
    /// dropped; the count of dropped volumes is returned.
    pub fn assign_volumes(&mut self, mut volumes: Vec<Volume>) -> usize {
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        for node in self.nodes.values_mut() {
            node.volumes.clear();
        }
        let mut dropped = 0;
        for volume in volumes {
            match self.nodes.get_mut(&volume.agent_id) {
                Some(node) => node.volumes.push(volume),
                None => {
                    tracing::debug!(
                        "dropping volume {} of unknown node {}",
                        volume.name,
                        volume.agent_id
                    );
                    dropped += 1;
                }
            }
        }
        dropped
    }

    pub fn remove_volume(&mut self, name: &str) {
        for node in self.nodes.values_mut() {
            node.volumes.retain(|v| v.name != name);
        }
    }

    /// Display metadata for every populated role. Fails on the first role the
    /// style table does not know.
    pub fn role_styles(&self) -> Result<Vec<RoleStyle>> {
        self.by_role
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(role, _)| role_style(role))
            .collect()
    }
}
