use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use serde::Serialize;
use silo_instance::InstanceId;
use tokio::{
    io::AsyncWriteExt,
    process::Command,
    sync::{mpsc, oneshot, watch},
};

use crate::config::BootstrapCredential;
use crate::layout::Layout;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("create dir {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("open log file {}: {source}", path.display())]
    OpenLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("spawn process: exec={}: {source}", exec.display())]
    Start {
        exec: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything needed to (re)launch one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub instance_id: InstanceId,
    pub port: u16,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub log_file: PathBuf,
    pub run_file: PathBuf,
}

impl SpawnSpec {
    pub fn for_instance(layout: &Layout, id: &InstanceId, port: u16) -> Self {
        Self {
            instance_id: id.clone(),
            port,
            data_dir: layout.data_dir(id),
            config_dir: layout.config_dir(id),
            log_file: layout.log_file(id),
            run_file: layout.run_file(id),
        }
    }
}

type SignalRequest = oneshot::Sender<bool>;

/// Agent-side view of a started child.
///
/// The task that reaps the child is the only one allowed to signal it, so a
/// signal can never reach a pid that was already reaped and possibly reused.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pid: u32,
    exited: watch::Receiver<bool>,
    signal: mpsc::UnboundedSender<SignalRequest>,
}

/// Reaper-side end of a [`ChildHandle`]. Dropping it marks the child exited.
#[derive(Debug)]
pub struct ChildControl {
    exited: watch::Sender<bool>,
    signal: mpsc::UnboundedReceiver<SignalRequest>,
}

pub fn child_channel(pid: u32) -> (ChildHandle, ChildControl) {
    let (exited_tx, exited_rx) = watch::channel(false);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    (
        ChildHandle {
            pid,
            exited: exited_rx,
            signal: signal_tx,
        },
        ChildControl {
            exited: exited_tx,
            signal: signal_rx,
        },
    )
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// False once the child has been reaped.
    pub fn is_running(&self) -> bool {
        !*self.exited.borrow() && self.exited.has_changed().is_ok()
    }

    /// Asks the reaper to SIGTERM the child's process group. Returns whether
    /// the signal was sent; `false` if the child is already gone.
    pub async fn request_terminate(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let (reply, answer) = oneshot::channel();
        if self.signal.send(reply).is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }
}

impl ChildControl {
    pub fn mark_exited(&self) {
        self.exited.send_replace(true);
    }

    /// Next terminate request; `None` once every handle is dropped.
    pub async fn next_request(&mut self) -> Option<SignalRequest> {
        self.signal.recv().await
    }
}

#[async_trait::async_trait]
pub trait Supervisor: Send + Sync + 'static {
    /// Starts the instance process. Returns once the OS has confirmed the
    /// start; reaping happens in the background.
    async fn spawn(&self, spec: &SpawnSpec) -> Result<ChildHandle, SpawnError>;

    /// Sends SIGTERM to the process group of a child that has not exited yet.
    /// Returns whether a signal was delivered.
    async fn terminate(&self, child: &ChildHandle) -> bool;
}

#[derive(Debug, Clone, Serialize)]
struct RunInfo {
    instance_id: String,
    port: u16,
    pid: u32,
    started_at_unix_ms: i64,
    agent_version: String,
    exec: String,
    args: Vec<String>,
}

async fn write_run_json(path: &Path, info: &RunInfo) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(info)?;
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(&data).await?;
    f.flush().await?;
    drop(f);
    tokio::fs::rename(&tmp, path).await
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, take the child down with it; recovery re-spawns it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

async fn mkdir_p(path: &Path) -> Result<(), SpawnError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| SpawnError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

/// Launches the storage server binary, one process per instance.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    exec: PathBuf,
    bootstrap: Option<BootstrapCredential>,
}

impl ProcessSupervisor {
    pub fn new(exec: impl Into<PathBuf>, bootstrap: Option<BootstrapCredential>) -> Self {
        Self {
            exec: exec.into(),
            bootstrap,
        }
    }

    pub fn server_args(spec: &SpawnSpec) -> Vec<String> {
        vec![
            "server".to_string(),
            "--address".to_string(),
            format!(":{}", spec.port),
            "--config-dir".to_string(),
            spec.config_dir.display().to_string(),
            spec.data_dir.display().to_string(),
        ]
    }

    async fn open_log(&self, spec: &SpawnSpec, args: &[String]) -> Result<std::fs::File, SpawnError> {
        let log_err = |source| SpawnError::OpenLog {
            path: spec.log_file.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .await
            .map_err(log_err)?;

        let header = format!(
            "[silo-agent] {} exec: {} {}\n",
            chrono::Utc::now().to_rfc3339(),
            self.exec.display(),
            args.join(" ")
        );
        file.write_all(header.as_bytes()).await.map_err(log_err)?;
        file.flush().await.map_err(log_err)?;
        Ok(file.into_std().await)
    }
}

#[async_trait::async_trait]
impl Supervisor for ProcessSupervisor {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<ChildHandle, SpawnError> {
        mkdir_p(&spec.data_dir).await?;
        mkdir_p(&spec.config_dir).await?;
        if let Some(parent) = spec.log_file.parent() {
            mkdir_p(parent).await?;
        }

        let args = Self::server_args(spec);
        let stdout = self.open_log(spec, &args).await?;
        let stderr = stdout.try_clone().map_err(|source| SpawnError::OpenLog {
            path: spec.log_file.clone(),
            source,
        })?;

        let mut cmd = Command::new(&self.exec);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(cred) = &self.bootstrap {
            cmd.env("MINIO_ACCESS_KEY", &cred.access_key)
                .env("MINIO_SECRET_KEY", &cred.secret_key);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the whole process tree can be signalled.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError::Start {
            exec: self.exec.clone(),
            source,
        })?;
        // Only `None` once the child has been awaited, which cannot have happened yet.
        let pid = child.id().unwrap_or_default();

        tracing::info!(instance_id = %spec.instance_id, port = spec.port, pid, "instance process started");

        let run = RunInfo {
            instance_id: spec.instance_id.to_string(),
            port: spec.port,
            pid,
            started_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            exec: self.exec.display().to_string(),
            args,
        };
        if let Err(err) = write_run_json(&spec.run_file, &run).await {
            tracing::debug!(instance_id = %spec.instance_id, error = %err, "failed to write run.json");
        }

        let (handle, mut control) = child_channel(pid);
        let instance_id = spec.instance_id.clone();
        tokio::spawn(async move {
            // While `wait` is pending the child is unreaped, so its pgid is still ours.
            let waited = loop {
                tokio::select! {
                    res = child.wait() => break res,
                    Some(reply) = control.next_request() => {
                        let _ = reply.send(signal_group(pid));
                    }
                }
            };
            control.mark_exited();
            match waited {
                Ok(status) => {
                    tracing::info!(%instance_id, pid, code = ?status.code(), success = status.success(), "instance process exited");
                }
                Err(err) => {
                    tracing::warn!(%instance_id, pid, error = %err, "wait on instance process failed");
                }
            }
        });

        Ok(handle)
    }

    async fn terminate(&self, child: &ChildHandle) -> bool {
        child.request_terminate().await
    }
}

#[cfg(unix)]
fn signal_group(pid: u32) -> bool {
    // pid 0 would address our own process group.
    let Ok(pgid) = i32::try_from(pid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    unsafe { libc::kill(-pgid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32) -> bool {
    false
}
