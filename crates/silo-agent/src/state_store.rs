use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use silo_instance::{Credential, DEFAULT_REGION, IdError, InstanceId, InstanceRecord};
use tokio::io::AsyncWriteExt;

use crate::layout::{Layout, RECORD_EXT};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
    #[error("corrupt record {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("record file {name:?} does not name a valid instance: {source}")]
    InvalidName {
        name: String,
        #[source]
        source: IdError,
    },
    #[error("credentials not written yet: {}", .0.display())]
    CredentialsUnavailable(PathBuf),
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(context: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io {
        context,
        path,
        source,
    }
}

/// One entry of a `load_all` snapshot.
#[derive(Debug)]
pub struct StoredEntry {
    /// File stem as found on disk.
    pub name: String,
    pub record: Result<(InstanceId, InstanceRecord), StoreError>,
}

#[derive(Debug, serde::Deserialize)]
struct ChildConfig {
    credential: ChildCredential,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildCredential {
    access_key: String,
    secret_key: String,
}

/// Durable per-instance lifecycle records.
#[derive(Debug, Clone)]
pub struct StateStore {
    layout: Layout,
}

impl StateStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub async fn ensure_dirs(&self) -> Result<(), StoreError> {
        for dir in [self.layout.instances_dir(), self.layout.minio_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(io_err("create dir", &dir))?;
        }
        Ok(())
    }

    pub async fn exists(&self, id: &InstanceId) -> Result<bool, StoreError> {
        let path = self.layout.lifecycle_file(id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(io_err("stat", &path))
    }

    pub async fn load(&self, id: &InstanceId) -> Result<InstanceRecord, StoreError> {
        let path = self.layout.lifecycle_file(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(io_err("read", &path)(e)),
        };
        serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt { path, source })
    }

    /// Snapshot of every lifecycle record currently on disk, sorted by name.
    ///
    /// A missing instances dir is an empty snapshot. Entries that fail to
    /// parse are returned individually so callers can report them.
    pub async fn load_all(&self) -> Result<Vec<StoredEntry>, StoreError> {
        let dir = self.layout.instances_dir();
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("read dir", &dir)(e)),
        };

        let mut names = Vec::new();
        while let Some(de) = rd.next_entry().await.map_err(io_err("read dir", &dir))? {
            let path = de.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            names.push(stem.to_string());
        }
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let record = match InstanceId::parse(&name) {
                Ok(id) if id.as_str() == name => {
                    self.load(&id).await.map(|rec| (id, rec))
                }
                Ok(_) => Err(StoreError::InvalidName {
                    name: name.clone(),
                    source: IdError::Invalid,
                }),
                Err(source) => Err(StoreError::InvalidName {
                    name: name.clone(),
                    source,
                }),
            };
            out.push(StoredEntry { name, record });
        }
        Ok(out)
    }

    /// Writes the record via temp file + rename so readers never see a
    /// partial file.
    pub async fn save(&self, id: &InstanceId, record: &InstanceRecord) -> Result<(), StoreError> {
        let dir = self.layout.instances_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_err("create dir", &dir))?;

        let path = self.layout.lifecycle_file(id);
        let tmp = path.with_extension(format!("{RECORD_EXT}.tmp"));
        let data = serde_json::to_vec(record).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(io_err("create", &tmp))?;
        f.write_all(&data).await.map_err(io_err("write", &tmp))?;
        f.sync_all().await.map_err(io_err("sync", &tmp))?;
        drop(f);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_err("persist", &path))?;
        Ok(())
    }

    /// Removes the instance tree, then the lifecycle record. Already-absent
    /// pieces are fine. The record goes last so a failed teardown can be
    /// retried.
    pub async fn delete(&self, id: &InstanceId) -> Result<(), StoreError> {
        let root = self.layout.instance_root(id);
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("remove dir", &root)(e)),
        }

        let path = self.layout.lifecycle_file(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("remove", &path)(e)),
        }
        Ok(())
    }

    /// Reads the credential the server wrote into its own config dir.
    pub async fn read_credential(&self, id: &InstanceId) -> Result<Credential, StoreError> {
        let path = self.layout.child_config_file(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::CredentialsUnavailable(path));
            }
            Err(e) => return Err(io_err("read", &path)(e)),
        };
        let cfg: ChildConfig = serde_json::from_slice(&raw)
            .map_err(|source| StoreError::Corrupt { path, source })?;

        let region = cfg
            .region
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        Ok(Credential {
            access_key: cfg.credential.access_key,
            secret_key: cfg.credential.secret_key,
            region,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InstanceId {
        InstanceId::parse(s).unwrap()
    }

    fn store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(Layout::new(dir.path()))
    }

    #[tokio::test]
    async fn save_then_load_round_trips_port() {
        let tmp = tempfile::TempDir::new().unwrap();
        let s = store(&tmp);
        s.save(&id("db1"), &InstanceRecord::new(9001)).await.unwrap();

        let raw = std::fs::read_to_string(tmp.path().join("instances/db1.json")).unwrap();
        assert_eq!(raw, r#"{"port":9001}"#);
        assert_eq!(s.load(&id("db1")).await.unwrap().port, 9001);
        assert!(s.exists(&id("db1")).await.unwrap());
        assert!(!tmp.path().join("instances/db1.json.tmp").exists());
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = store(&tmp).load(&id("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn load_garbage_is_corrupt() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("instances")).unwrap();
        std::fs::write(tmp.path().join("instances/bad.json"), b"{not json").unwrap();
        let err = store(&tmp).load(&id("bad")).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn load_all_without_dir_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(store(&tmp).load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_all_reports_each_entry_and_skips_temp_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let s = store(&tmp);
        s.save(&id("a"), &InstanceRecord::new(9001)).await.unwrap();
        s.save(&id("b"), &InstanceRecord::new(9002)).await.unwrap();
        let dir = tmp.path().join("instances");
        std::fs::write(dir.join("c.json"), b"[]").unwrap();
        std::fs::write(dir.join("d.json.tmp"), b"{\"port\":1}").unwrap();
        std::fs::write(dir.join("README"), b"hi").unwrap();

        let all = s.load_all().await.unwrap();
        let names: Vec<_> = all.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(all[0].record.as_ref().unwrap().1.port, 9001);
        assert_eq!(all[1].record.as_ref().unwrap().1.port, 9002);
        assert!(matches!(all[2].record, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn delete_removes_tree_and_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let s = store(&tmp);
        let db = id("db1");
        s.save(&db, &InstanceRecord::new(9001)).await.unwrap();
        std::fs::create_dir_all(s.layout().data_dir(&db)).unwrap();
        std::fs::create_dir_all(s.layout().logs_dir(&db)).unwrap();

        s.delete(&db).await.unwrap();
        assert!(!s.layout().instance_root(&db).exists());
        assert!(!s.exists(&db).await.unwrap());

        s.delete(&db).await.unwrap();
    }

    #[tokio::test]
    async fn read_credential_defaults_region() {
        let tmp = tempfile::TempDir::new().unwrap();
        let s = store(&tmp);
        let db = id("db1");
        std::fs::create_dir_all(s.layout().config_dir(&db)).unwrap();
        std::fs::write(
            s.layout().child_config_file(&db),
            br#"{"version":"13","credential":{"accessKey":"AK","secretKey":"SK"},"region":""}"#,
        )
        .unwrap();

        let c = s.read_credential(&db).await.unwrap();
        assert_eq!(c.access_key, "AK");
        assert_eq!(c.secret_key, "SK");
        assert_eq!(c.region, DEFAULT_REGION);
    }

    #[tokio::test]
    async fn read_credential_before_server_wrote_it() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = store(&tmp).read_credential(&id("db1")).await.unwrap_err();
        assert!(matches!(err, StoreError::CredentialsUnavailable(_)));
    }
}
