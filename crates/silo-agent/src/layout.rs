//! On-disk layout of the agent root.
//!
//! ```text
//! {root}/instances/{id}.json           lifecycle record ({"port": N})
//! {root}/minio/{id}/config/config.json written by the server itself
//! {root}/minio/{id}/data/
//! {root}/minio/{id}/logs/minio.log
//! {root}/minio/{id}/run.json           launch diagnostics
//! ```
//!
//! Everything here is pure path arithmetic; no function touches the disk.

use std::path::PathBuf;

use silo_instance::InstanceId;

const INSTANCES_DIR: &str = "instances";
const MINIO_DIR: &str = "minio";
pub const RECORD_EXT: &str = "json";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join(INSTANCES_DIR)
    }

    pub fn minio_dir(&self) -> PathBuf {
        self.root.join(MINIO_DIR)
    }

    pub fn lifecycle_file(&self, id: &InstanceId) -> PathBuf {
        self.instances_dir()
            .join(format!("{}.{RECORD_EXT}", id.as_str()))
    }

    pub fn instance_root(&self, id: &InstanceId) -> PathBuf {
        self.minio_dir().join(id.as_str())
    }

    pub fn config_dir(&self, id: &InstanceId) -> PathBuf {
        self.instance_root(id).join("config")
    }

    pub fn child_config_file(&self, id: &InstanceId) -> PathBuf {
        self.config_dir(id).join("config.json")
    }

    pub fn data_dir(&self, id: &InstanceId) -> PathBuf {
        self.instance_root(id).join("data")
    }

    pub fn logs_dir(&self, id: &InstanceId) -> PathBuf {
        self.instance_root(id).join("logs")
    }

    pub fn log_file(&self, id: &InstanceId) -> PathBuf {
        self.logs_dir(id).join("minio.log")
    }

    pub fn run_file(&self, id: &InstanceId) -> PathBuf {
        self.instance_root(id).join("run.json")
    }
}
