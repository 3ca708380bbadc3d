use std::fmt;

const MAX_ID_BYTES: usize = 128;

/// Default region reported when a child config does not carry one.
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("instance_id must be non-empty")]
    Empty,
    #[error("instance_id is too long (max {MAX_ID_BYTES} bytes)")]
    TooLong,
    #[error("invalid instance_id")]
    Invalid,
}

/// Caller-supplied instance identifier.
///
/// NOTE: The id becomes a file name under the agent root, so only a small
/// path-safe alphabet is accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Validates `id` as given; surrounding whitespace is rejected, not trimmed.
    pub fn parse(id: &str) -> Result<Self, IdError> {
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.len() > MAX_ID_BYTES {
            return Err(IdError::TooLong);
        }
        if id.starts_with('.')
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(IdError::Invalid);
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        InstanceId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
}

/// Durable lifecycle record. Only the port is persisted; status is tracked
/// by the agent for the current process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstanceRecord {
    #[serde(alias = "Port")]
    pub port: u16,
    #[serde(skip, default = "InstanceRecord::default_status")]
    pub status: InstanceStatus,
}

impl InstanceRecord {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            status: InstanceStatus::Pending,
        }
    }

    fn default_status() -> InstanceStatus {
        InstanceStatus::Stopped
    }
}

/// Access credential persisted by the storage server itself.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Caller-facing view returned by `GET /instances/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    #[serde(rename = "endpointURL")]
    pub endpoint_url: String,
    pub port: u16,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub instance_id: InstanceId,
    pub port: u16,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub instance_id: InstanceId,
    pub stop_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_accepts_uuid_like_ids() {
        let id = InstanceId::parse("1b9e3c2a-7d4f-4e1c-9a51-0c2b7e8f6a10").unwrap();
        assert_eq!(id.as_str(), "1b9e3c2a-7d4f-4e1c-9a51-0c2b7e8f6a10");
    }

    #[test]
    fn instance_id_rejects_path_tricks() {
        assert_eq!(InstanceId::parse(""), Err(IdError::Empty));
        assert_eq!(InstanceId::parse(".."), Err(IdError::Invalid));
        assert_eq!(InstanceId::parse(".hidden"), Err(IdError::Invalid));
        assert_eq!(InstanceId::parse("a/b"), Err(IdError::Invalid));
        assert_eq!(InstanceId::parse(&"x".repeat(129)), Err(IdError::TooLong));
    }

    #[test]
    fn instance_id_rejects_surrounding_whitespace() {
        for raw in ["db1 ", " db1", "db1\n", " "] {
            assert_eq!(InstanceId::parse(raw), Err(IdError::Invalid), "{raw:?}");
        }
    }

    #[test]
    fn record_persists_only_the_port() {
        let mut rec = InstanceRecord::new(9001);
        rec.status = InstanceStatus::Running;
        let json = serde_json::to_string(&rec).unwrap();
        assert_eq!(json, r#"{"port":9001}"#);

        let back: InstanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, 9001);
        assert_eq!(back.status, InstanceStatus::Stopped);
    }

    #[test]
    fn record_reads_legacy_capitalized_port() {
        let rec: InstanceRecord = serde_json::from_str(r#"{"Port":9007}"#).unwrap();
        assert_eq!(rec.port, 9007);
    }

    #[test]
    fn info_uses_broker_field_names() {
        let info = InstanceInfo {
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            region: DEFAULT_REGION.to_string(),
            endpoint_url: "http://localhost:9001".to_string(),
            port: 9001,
            status: InstanceStatus::Running,
        };
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["accessKey"], "ak");
        assert_eq!(v["endpointURL"], "http://localhost:9001");
        assert_eq!(v["status"], "running");
    }

    #[test]
    fn credential_debug_hides_secret() {
        let c = Credential {
            access_key: "ak".to_string(),
            secret_key: "topsecret".to_string(),
            region: DEFAULT_REGION.to_string(),
        };
        assert!(!format!("{c:?}").contains("topsecret"));
    }
}
