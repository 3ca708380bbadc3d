use std::{collections::HashMap, sync::Arc};

use silo_instance::{
    DeleteOutcome, IdError, InstanceId, InstanceInfo, InstanceRecord, InstanceStatus,
    InstanceSummary,
};
use tokio::sync::Mutex;

use crate::admin::{AdminClient, SignedAdminClient};
use crate::config::AgentConfig;
use crate::layout::Layout;
use crate::port_alloc::{AllocError, PortAllocator};
use crate::state_store::{StateStore, StoreError};
use crate::supervisor::{ChildHandle, ProcessSupervisor, SpawnError, SpawnSpec, Supervisor};

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error(transparent)]
    InvalidId(#[from] IdError),
    #[error("instance {0} already exists")]
    AlreadyExists(InstanceId),
    #[error("instance {0} not found")]
    NotFound(InstanceId),
    #[error("no capacity: all {capacity} ports in {start}..{end} are in use")]
    NoCapacity { start: u16, end: u16, capacity: usize },
    #[error("failed to start instance {id}: {source}")]
    Spawn {
        id: InstanceId,
        #[source]
        source: SpawnError,
    },
    #[error("instance {0} has not written its credentials yet")]
    CredentialsUnavailable(InstanceId),
    #[error(transparent)]
    Io(StoreError),
}

impl InstanceError {
    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            InstanceError::InvalidId(_) => "invalid_id",
            InstanceError::AlreadyExists(_) => "already_exists",
            InstanceError::NotFound(_) => "not_found",
            InstanceError::NoCapacity { .. } => "no_capacity",
            InstanceError::Spawn { .. } => "spawn_failed",
            InstanceError::CredentialsUnavailable(_) => "credentials_unavailable",
            InstanceError::Io(_) => "io_error",
        }
    }

    fn from_store(id: &InstanceId, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => InstanceError::NotFound(id.clone()),
            StoreError::CredentialsUnavailable(_) => {
                InstanceError::CredentialsUnavailable(id.clone())
            }
            other => InstanceError::Io(other),
        }
    }
}

impl From<AllocError> for InstanceError {
    fn from(value: AllocError) -> Self {
        match value {
            AllocError::Exhausted {
                start,
                end,
                capacity,
            } => InstanceError::NoCapacity {
                start,
                end,
                capacity,
            },
            AllocError::Store(e) => InstanceError::Io(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryFailure {
    /// Record name as found on disk; may not be a valid id.
    pub instance: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<InstanceSummary>,
    pub failures: Vec<RecoveryFailure>,
}

struct Inner {
    store: StateStore,
    ports: PortAllocator,
    // Children started during this agent lifetime. Not persisted.
    children: HashMap<InstanceId, ChildHandle>,
}

impl Inner {
    fn status_of(&self, id: &InstanceId) -> (InstanceStatus, Option<u32>) {
        match self.children.get(id) {
            Some(child) if child.is_running() => (InstanceStatus::Running, Some(child.pid())),
            _ => (InstanceStatus::Stopped, None),
        }
    }
}

/// Owns every instance on this host.
///
/// All operations run under one async mutex, so port allocation, existence
/// checks and directory changes never interleave.
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<Mutex<Inner>>,
    supervisor: Arc<dyn Supervisor>,
    admin: Arc<dyn AdminClient>,
    config: Arc<AgentConfig>,
}

impl InstanceManager {
    pub fn new(
        config: AgentConfig,
        supervisor: Arc<dyn Supervisor>,
        admin: Arc<dyn AdminClient>,
    ) -> Self {
        let inner = Inner {
            store: StateStore::new(Layout::new(&config.root_dir)),
            ports: PortAllocator::new(config.port_range()),
            children: HashMap::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            supervisor,
            admin,
            config: Arc::new(config),
        }
    }

    /// Manager wired to the real server binary and signed stop requests.
    pub fn from_config(config: AgentConfig) -> anyhow::Result<Self> {
        let supervisor = ProcessSupervisor::new(&config.minio_bin, config.bootstrap.clone());
        let admin = SignedAdminClient::new(config.stop_timeout)?;
        Ok(Self::new(config, Arc::new(supervisor), Arc::new(admin)))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn ensure_dirs(&self) -> Result<(), InstanceError> {
        let inner = self.inner.lock().await;
        inner.store.ensure_dirs().await.map_err(InstanceError::Io)
    }

    pub async fn create(&self, instance_id: &str) -> Result<InstanceSummary, InstanceError> {
        let id = InstanceId::parse(instance_id)?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.store.exists(&id).await.map_err(InstanceError::Io)? {
            return Err(InstanceError::AlreadyExists(id));
        }

        let port = inner.ports.allocate(&inner.store).await?;
        let mut record = InstanceRecord::new(port);
        let spec = SpawnSpec::for_instance(inner.store.layout(), &id, port);

        let child = match self.supervisor.spawn(&spec).await {
            Ok(child) => child,
            Err(source) => {
                // Nothing was persisted; drop whatever directories the attempt left.
                if let Err(err) = inner.store.delete(&id).await {
                    tracing::warn!(instance_id = %id, error = %err, "cleanup after failed spawn");
                }
                tracing::error!(instance_id = %id, port, error = %source, "instance spawn failed");
                return Err(InstanceError::Spawn { id, source });
            }
        };
        record.status = InstanceStatus::Running;
        let pid = child.pid();

        if let Err(err) = inner.store.save(&id, &record).await {
            self.supervisor.terminate(&child).await;
            if let Err(cleanup) = inner.store.delete(&id).await {
                tracing::warn!(instance_id = %id, error = %cleanup, "cleanup after failed save");
            }
            tracing::error!(instance_id = %id, port, pid, error = %err, "failed to persist instance record");
            return Err(InstanceError::Io(err));
        }
        inner.children.insert(id.clone(), child);

        tracing::info!(instance_id = %id, port, pid, "instance created");
        Ok(InstanceSummary {
            instance_id: id,
            port,
            status: record.status,
            pid: Some(pid),
        })
    }

    pub async fn get(&self, instance_id: &str) -> Result<InstanceInfo, InstanceError> {
        let id = InstanceId::parse(instance_id)?;
        let inner = self.inner.lock().await;

        let record = inner
            .store
            .load(&id)
            .await
            .map_err(|e| InstanceError::from_store(&id, e))?;
        let cred = inner
            .store
            .read_credential(&id)
            .await
            .map_err(|e| InstanceError::from_store(&id, e))?;
        let (status, _) = inner.status_of(&id);

        Ok(InstanceInfo {
            access_key: cred.access_key,
            secret_key: cred.secret_key,
            region: cred.region,
            endpoint_url: self.config.endpoint_url(record.port),
            port: record.port,
            status,
        })
    }

    /// Stops and removes an instance.
    ///
    /// The stop request is best effort: the tree and record are removed even
    /// if it fails, and the failure is reported in the outcome. In that case
    /// the server may still be running (SIGTERM is sent to its process group
    /// when this agent started it and it has not exited).
    pub async fn delete(&self, instance_id: &str) -> Result<DeleteOutcome, InstanceError> {
        let id = InstanceId::parse(instance_id)?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let port = match inner.store.load(&id).await {
            Ok(rec) => Some(rec.port),
            Err(StoreError::NotFound(_)) => return Err(InstanceError::NotFound(id)),
            Err(StoreError::Corrupt { .. }) => None,
            Err(err) => return Err(InstanceError::Io(err)),
        };

        let stopped: Result<(), String> = match port {
            None => Err("lifecycle record unreadable, stop request skipped".to_string()),
            Some(port) => match inner.store.read_credential(&id).await {
                Ok(cred) => self.admin.stop(port, &cred).await.map_err(|e| e.to_string()),
                Err(err) => Err(format!("cannot sign stop request: {err}")),
            },
        };

        let child = inner.children.get(&id).cloned();
        let pid = child.as_ref().map(ChildHandle::pid);
        let warning = match stopped {
            Ok(()) => None,
            Err(reason) => {
                let signalled = match &child {
                    Some(child) => self.supervisor.terminate(child).await,
                    None => false,
                };
                let warning = match &child {
                    Some(child) if signalled => {
                        format!("{reason}; sent SIGTERM to pid {}", child.pid())
                    }
                    Some(child) if !child.is_running() => {
                        format!("{reason}; server process already exited")
                    }
                    _ => format!("{reason}; server process may still be running"),
                };
                tracing::warn!(instance_id = %id, ?port, ?pid, %warning, "instance stop not confirmed");
                Some(warning)
            }
        };

        inner.store.delete(&id).await.map_err(|err| {
            tracing::error!(instance_id = %id, error = %err, "instance teardown failed");
            InstanceError::Io(err)
        })?;
        inner.children.remove(&id);

        tracing::info!(instance_id = %id, ?port, stop_confirmed = warning.is_none(), "instance deleted");
        Ok(DeleteOutcome {
            instance_id: id,
            stop_confirmed: warning.is_none(),
            warning,
        })
    }

    pub async fn list(&self) -> Result<Vec<InstanceSummary>, InstanceError> {
        let inner = self.inner.lock().await;
        let entries = inner.store.load_all().await.map_err(InstanceError::Io)?;

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.record {
                Ok((id, rec)) => {
                    let (status, pid) = inner.status_of(&id);
                    out.push(InstanceSummary {
                        instance_id: id,
                        port: rec.port,
                        status,
                        pid,
                    });
                }
                Err(err) => {
                    tracing::warn!(record = %entry.name, error = %err, "skipping unreadable record");
                }
            }
        }
        Ok(out)
    }

    /// Re-spawns every persisted instance. Meant to run once at startup,
    /// before the control plane accepts requests.
    ///
    /// One bad instance does not stop the others; failures are collected in
    /// the report. Only an unreadable instances dir fails the whole call.
    pub async fn recover(&self) -> Result<RecoveryReport, InstanceError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let entries = inner.store.load_all().await.map_err(InstanceError::Io)?;

        let mut report = RecoveryReport::default();
        for entry in entries {
            let (id, rec) = match entry.record {
                Ok(v) => v,
                Err(err) => {
                    tracing::error!(record = %entry.name, error = %err, "cannot recover instance");
                    report.failures.push(RecoveryFailure {
                        instance: entry.name,
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let spec = SpawnSpec::for_instance(inner.store.layout(), &id, rec.port);
            match self.supervisor.spawn(&spec).await {
                Ok(child) => {
                    let pid = child.pid();
                    inner.children.insert(id.clone(), child);
                    tracing::info!(instance_id = %id, port = rec.port, pid, "instance recovered");
                    report.recovered.push(InstanceSummary {
                        instance_id: id,
                        port: rec.port,
                        status: InstanceStatus::Running,
                        pid: Some(pid),
                    });
                }
                Err(err) => {
                    tracing::error!(instance_id = %id, port = rec.port, error = %err, "cannot recover instance");
                    report.failures.push(RecoveryFailure {
                        instance: entry.name,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}
