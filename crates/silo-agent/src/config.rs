use std::{net::IpAddr, path::PathBuf, time::Duration};

use anyhow::Context;

const DEFAULT_AGENT_PORT: u16 = 9000;
const DEFAULT_ROOT_DIR: &str = "/var/vcap/store/minio-agent";
const DEFAULT_MINIO_BIN: &str = "/var/vcap/packages/minio/minio";
const DEFAULT_BASE_PORT: u16 = 9001;
const DEFAULT_MAX_INSTANCES: u16 = 100;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5000;

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u16(name: &str) -> Option<u16> {
    env_str(name).and_then(|v| v.parse::<u16>().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env_str(name).and_then(|v| v.parse::<u64>().ok())
}

/// Credential handed to freshly spawned servers through their environment.
#[derive(Clone)]
pub struct BootstrapCredential {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for BootstrapCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapCredential")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind: IpAddr,
    pub agent_port: u16,
    pub root_dir: PathBuf,
    pub minio_bin: PathBuf,
    pub base_port: u16,
    pub max_instances: u16,
    /// Public domain used to build endpoint URLs. `None` means localhost.
    pub domain: Option<String>,
    pub bootstrap: Option<BootstrapCredential>,
    pub stop_timeout: Duration,
}

impl AgentConfig {
    /// Defaults rooted at `root_dir`; environment is not consulted.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            agent_port: DEFAULT_AGENT_PORT,
            root_dir: root_dir.into(),
            minio_bin: PathBuf::from(DEFAULT_MINIO_BIN),
            base_port: DEFAULT_BASE_PORT,
            max_instances: DEFAULT_MAX_INSTANCES,
            domain: None,
            bootstrap: None,
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::new(env_str("SILO_ROOT_DIR").unwrap_or_else(|| DEFAULT_ROOT_DIR.into()));

        if let Some(raw) = env_str("SILO_AGENT_BIND") {
            cfg.bind = raw
                .parse()
                .with_context(|| format!("invalid SILO_AGENT_BIND: {raw}"))?;
        }
        if let Some(port) = env_u16("SILO_AGENT_PORT").or_else(|| env_u16("MINIO_AGENT_PORT")) {
            cfg.agent_port = port;
        }
        if let Some(bin) = env_str("SILO_MINIO_BIN") {
            cfg.minio_bin = PathBuf::from(bin);
        }
        if let Some(port) = env_u16("SILO_BASE_PORT") {
            cfg.base_port = port.max(1024);
        }
        if let Some(max) = env_u16("SILO_MAX_INSTANCES") {
            cfg.max_instances = max.clamp(1, 10_000);
        }
        cfg.domain = env_str("SILO_DOMAIN").or_else(|| env_str("CF_DOMAIN"));

        cfg.bootstrap = match (
            env_str("SILO_BOOTSTRAP_ACCESS_KEY"),
            env_str("SILO_BOOTSTRAP_SECRET_KEY"),
        ) {
            (Some(access_key), Some(secret_key)) => Some(BootstrapCredential {
                access_key,
                secret_key,
            }),
            (None, None) => None,
            _ => anyhow::bail!(
                "SILO_BOOTSTRAP_ACCESS_KEY and SILO_BOOTSTRAP_SECRET_KEY must be set together"
            ),
        };

        if let Some(ms) = env_u64("SILO_STOP_TIMEOUT_MS") {
            cfg.stop_timeout = Duration::from_millis(ms.clamp(500, 60_000));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_instances == 0 {
            anyhow::bail!("max_instances must be at least 1");
        }
        if u32::from(self.base_port) + u32::from(self.max_instances) > u32::from(u16::MAX) {
            anyhow::bail!(
                "port range {}..{} does not fit in u16",
                self.base_port,
                u32::from(self.base_port) + u32::from(self.max_instances)
            );
        }
        if self.port_range().contains(&self.agent_port) {
            anyhow::bail!(
                "agent port {} overlaps the instance port range",
                self.agent_port
            );
        }
        Ok(())
    }

    /// Half-open instance port range `[base_port, base_port + max_instances)`.
    pub fn port_range(&self) -> std::ops::Range<u16> {
        let end = self.base_port.saturating_add(self.max_instances);
        self.base_port..end
    }

    pub fn endpoint_url(&self, port: u16) -> String {
        match &self.domain {
            Some(domain) => format!("https://{port}.minio.{domain}"),
            None => format!("http://localhost:{port}"),
        }
    }
}
