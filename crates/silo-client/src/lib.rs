//! Client for the silo-agent control plane.

use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use silo_instance::{DeleteOutcome, InstanceInfo, InstanceSummary};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid agent url: {0}")]
    Url(String),
    #[error("request to agent failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("agent returned HTTP {status} ({code}): {message}")]
    Status {
        status: StatusCode,
        code: String,
        message: String,
    },
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
pub struct AgentClient {
    base: Url,
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Result<Self, ClientError> {
        let base = Url::parse(base_url).map_err(|e| ClientError::Url(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::Url(format!("{base_url}: not a base url")));
        }
        Ok(Self { base, http })
    }

    fn instance_url(&self, instance_id: &str) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(["instances", instance_id]);
        Ok(url)
    }

    async fn execute<T: DeserializeOwned>(&self, method: Method, url: Url) -> Result<T, ClientError> {
        let resp = self.http.request(method, url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            let (code, message) = match serde_json::from_slice::<ErrorBody>(&bytes) {
                Ok(body) => (body.code, body.message),
                Err(_) => (String::new(), String::from_utf8_lossy(&bytes).into_owned()),
            };
            return Err(ClientError::Status {
                status,
                code,
                message,
            });
        }
        Ok(resp.json::<T>().await?)
    }

    pub async fn create_instance(&self, instance_id: &str) -> Result<InstanceSummary, ClientError> {
        let url = self.instance_url(instance_id)?;
        self.execute(Method::PUT, url).await
    }

    pub async fn instance_info(&self, instance_id: &str) -> Result<InstanceInfo, ClientError> {
        let url = self.instance_url(instance_id)?;
        self.execute(Method::GET, url).await
    }

    pub async fn delete_instance(&self, instance_id: &str) -> Result<DeleteOutcome, ClientError> {
        let url = self.instance_url(instance_id)?;
        self.execute(Method::DELETE, url).await
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceSummary>, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Url(self.base.to_string()))?
            .pop_if_empty()
            .push("instances");
        self.execute(Method::GET, url).await
    }
}
