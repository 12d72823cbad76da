//! Durable storage of service records.
//!
//! The orchestration core only needs get/put by service id. Two backends are
//! provided: an in-memory map and a single JSON file.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};

use crate::{
    error::{Error, Result},
    service::{RecordPatch, Service},
};

const REGISTRY_VERSION: u32 = 1;

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn load(&self, service_id: u64) -> Result<Service>;

    /// Overwrites only the fields set in `patch`, checked against the stored
    /// lifecycle state under the registry lock. Returns the stored record.
    async fn save(&self, service_id: u64, patch: RecordPatch) -> Result<Service>;

    /// Stores a new service under a freshly allocated id and returns it.
    async fn insert(&self, service: Service) -> Result<Service>;

    async fn remove(&self, service_id: u64) -> Result<()>;

    async fn list(&self, owner_id: &str) -> Result<Vec<Service>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryState {
    version: u32,
    next_id: u64,
    services: BTreeMap<u64, Service>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            next_id: 1,
            services: BTreeMap::new(),
        }
    }
}

impl RegistryState {
    fn load(&self, service_id: u64) -> Result<Service> {
        self.services
            .get(&service_id)
            .cloned()
            .ok_or(Error::ServiceNotFound(service_id))
    }

    /// Returns the stored record and whether it changed.
    fn save(&mut self, service_id: u64, patch: RecordPatch) -> Result<(Service, bool)> {
        let service = self
            .services
            .get_mut(&service_id)
            .ok_or(Error::ServiceNotFound(service_id))?;
        let applied = !patch.is_empty() && patch.apply(service)?;
        Ok((service.clone(), applied))
    }

    fn insert(&mut self, mut service: Service) -> Service {
        service.service_id = self.next_id;
        if service.manager_service_id == 0 {
            service.manager_service_id = service.service_id;
        }
        self.next_id += 1;
        self.services.insert(service.service_id, service.clone());
        service
    }

    fn list(&self, owner_id: &str) -> Vec<Service> {
        self.services
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect()
    }
}

/// Registry kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn load(&self, service_id: u64) -> Result<Service> {
        self.state.lock().await.load(service_id)
    }

    async fn save(&self, service_id: u64, patch: RecordPatch) -> Result<Service> {
        let (service, _) = self.state.lock().await.save(service_id, patch)?;
        Ok(service)
    }

    async fn insert(&self, service: Service) -> Result<Service> {
        Ok(self.state.lock().await.insert(service))
    }

    async fn remove(&self, service_id: u64) -> Result<()> {
        self.state.lock().await.services.remove(&service_id);
        Ok(())
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<Service>> {
        Ok(self.state.lock().await.list(owner_id))
    }
}

/// Registry persisted as one JSON document. The previous document is kept
/// as `<file>.backup` on every write.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

fn persistence<E: std::fmt::Display>(path: &Path) -> impl Fn(E) -> Error + '_ {
    move |e| Error::Persistence(format!("{}: {}", path.display(), e))
}

impl FileRegistry {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    async fn read_state(&self) -> Result<RegistryState> {
        if !fs::try_exists(&self.path)
            .await
            .map_err(persistence(&self.path))?
        {
            tracing::debug!("registry file not found, starting empty");
            return Ok(RegistryState::default());
        }
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(persistence(&self.path))?;
        let state: RegistryState =
            serde_json::from_str(&content).map_err(persistence(&self.path))?;
        if state.version > REGISTRY_VERSION {
            return Err(Error::Persistence(format!(
                "registry version {} is newer than supported version {}",
                state.version, REGISTRY_VERSION
            )));
        }
        Ok(state)
    }

    async fn write_state(&self, state: &RegistryState) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await.map_err(persistence(dir))?;
        }
        if fs::try_exists(&self.path)
            .await
            .map_err(persistence(&self.path))?
        {
            fs::copy(&self.path, self.backup_path())
                .await
                .map_err(persistence(&self.path))?;
        }
        let content = serde_json::to_string_pretty(state).map_err(persistence(&self.path))?;
        fs::write(&self.path, content)
            .await
            .map_err(persistence(&self.path))?;
        tracing::debug!("saved registry with {} services", state.services.len());
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistry for FileRegistry {
    async fn load(&self, service_id: u64) -> Result<Service> {
        let _guard = self.lock.lock().await;
        self.read_state().await?.load(service_id)
    }

    async fn save(&self, service_id: u64, patch: RecordPatch) -> Result<Service> {
        let _guard = self.lock.lock().await;
        let mut state = self.read_state().await?;
        let (service, applied) = state.save(service_id, patch)?;
        if applied {
            self.write_state(&state).await?;
        }
        Ok(service)
    }

    async fn insert(&self, service: Service) -> Result<Service> {
        let _guard = self.lock.lock().await;
        let mut state = self.read_state().await?;
        let service = state.insert(service);
        self.write_state(&state).await?;
        Ok(service)
    }

    async fn remove(&self, service_id: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.read_state().await?;
        if state.services.remove(&service_id).is_some() {
            self.write_state(&state).await?;
        }
        Ok(())
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<Service>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_state().await?.list(owner_id))
    }
}
