//! Administrative messages sent to a running instance.
//!
//! The only message the agent needs is "stop": a SigV4-signed
//! `POST /?service` with `x-minio-operation: stop`, signed with the
//! instance's own credential.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use silo_instance::Credential;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const OPERATION_HEADER: &str = "x-minio-operation";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("stop request to port {port} failed: {source}")]
    Request {
        port: u16,
        #[source]
        source: reqwest::Error,
    },
    #[error("instance on port {port} rejected stop: HTTP {status}")]
    Rejected { port: u16, status: u16 },
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Request fields covered by a V4 signature.
#[derive(Debug, Clone)]
pub struct SigningInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Already canonical (sorted, encoded) query string, e.g. `service=`.
    pub query: &'a str,
    /// Lowercase header name → value. Must include `host`.
    pub headers: &'a BTreeMap<String, String>,
    pub payload_hash: &'a str,
}

/// Returns the `Authorization` header value for `input`.
pub fn authorization(input: &SigningInput<'_>, cred: &Credential, at: DateTime<Utc>) -> String {
    let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
    let day = at.format("%Y%m%d").to_string();

    let canonical_headers: String = input
        .headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers = input
        .headers
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method,
        input.path,
        input.query,
        canonical_headers,
        signed_headers,
        input.payload_hash
    );

    let scope = format!("{day}/{}/{SERVICE}/aws4_request", cred.region);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac(format!("AWS4{}", cred.secret_key).as_bytes(), day.as_bytes());
    let k_region = hmac(&k_date, cred.region.as_bytes());
    let k_service = hmac(&k_region, SERVICE.as_bytes());
    let k_signing = hmac(&k_service, b"aws4_request");
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes()));

    format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        cred.access_key
    )
}

/// Full header set for a signed stop request to `host`.
pub fn stop_headers(host: &str, cred: &Credential, at: DateTime<Utc>) -> BTreeMap<String, String> {
    let payload_hash = sha256_hex(b"");
    let mut headers = BTreeMap::new();
    headers.insert("host".to_string(), host.to_string());
    headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
    headers.insert(
        "x-amz-date".to_string(),
        at.format("%Y%m%dT%H%M%SZ").to_string(),
    );
    headers.insert(OPERATION_HEADER.to_string(), "stop".to_string());

    let auth = authorization(
        &SigningInput {
            method: "POST",
            path: "/",
            query: "service=",
            headers: &headers,
            payload_hash: &payload_hash,
        },
        cred,
        at,
    );
    headers.insert("authorization".to_string(), auth);
    headers
}

#[async_trait::async_trait]
pub trait AdminClient: Send + Sync + 'static {
    /// Asks the instance listening on `port` to shut down.
    async fn stop(&self, port: u16, credential: &Credential) -> Result<(), StopError>;
}

/// Talks to instances on localhost over plain HTTP.
#[derive(Debug, Clone)]
pub struct SignedAdminClient {
    http: reqwest::Client,
}

impl SignedAdminClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("silo-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl AdminClient for SignedAdminClient {
    async fn stop(&self, port: u16, credential: &Credential) -> Result<(), StopError> {
        let host = format!("localhost:{port}");
        let url = format!("http://{host}/?service");

        let mut req = self.http.post(&url);
        for (k, v) in stop_headers(&host, credential, Utc::now()) {
            // reqwest derives Host from the URL.
            if k != "host" {
                req = req.header(k, v);
            }
        }

        let resp = req
            .send()
            .await
            .map_err(|source| StopError::Request { port, source })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StopError::Rejected {
                port,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
