use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

use reqwest::StatusCode;
use silo_agent::{
    AgentConfig, InstanceManager,
    admin::{AdminClient, StopError},
    api,
    supervisor::{ChildControl, ChildHandle, SpawnError, SpawnSpec, Supervisor, child_channel},
};
use silo_client::{AgentClient, ClientError};
use silo_instance::{Credential, InstanceStatus};

struct FakeServer {
    next_pid: AtomicU32,
    children: Mutex<Vec<ChildControl>>,
    write_credentials: bool,
}

#[async_trait::async_trait]
impl Supervisor for FakeServer {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<ChildHandle, SpawnError> {
        std::fs::create_dir_all(&spec.data_dir).unwrap();
        std::fs::create_dir_all(&spec.config_dir).unwrap();
        if self.write_credentials {
            std::fs::write(
                spec.config_dir.join("config.json"),
                r#"{"credential":{"accessKey":"AK","secretKey":"SK"},"region":""}"#,
            )
            .unwrap();
        }
        let (handle, control) = child_channel(self.next_pid.fetch_add(1, Ordering::SeqCst));
        self.children.lock().unwrap().push(control);
        Ok(handle)
    }

    async fn terminate(&self, child: &ChildHandle) -> bool {
        child.is_running()
    }
}

struct AcceptStop;

#[async_trait::async_trait]
impl AdminClient for AcceptStop {
    async fn stop(&self, _port: u16, _credential: &Credential) -> Result<(), StopError> {
        Ok(())
    }
}

struct Agent {
    _tmp: tempfile::TempDir,
    base: String,
    client: AgentClient,
}

async fn start_agent(max_instances: u16, write_credentials: bool) -> Agent {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut cfg = AgentConfig::new(tmp.path());
    cfg.max_instances = max_instances;
    cfg.domain = Some("sys.example.com".to_string());

    let supervisor = Arc::new(FakeServer {
        next_pid: AtomicU32::new(4000),
        children: Mutex::new(Vec::new()),
        write_credentials,
    });
    let manager = InstanceManager::new(cfg, supervisor, Arc::new(AcceptStop));
    manager.ensure_dirs().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(manager)).await.unwrap();
    });

    let base = format!("http://{addr}");
    let client = AgentClient::new(&base).unwrap();
    Agent {
        _tmp: tmp,
        base,
        client,
    }
}

fn assert_status(err: ClientError, want: StatusCode, want_code: &str) {
    match err {
        ClientError::Status { status, code, .. } => {
            assert_eq!(status, want);
            assert_eq!(code, want_code);
        }
        other => panic!("expected HTTP {want}, got {other}"),
    }
}

#[tokio::test]
async fn lifecycle_over_http() {
    let agent = start_agent(10, true).await;
    let c = &agent.client;

    let created = c.create_instance("db1").await.unwrap();
    assert_eq!(created.port, 9001);
    assert_eq!(created.status, InstanceStatus::Running);
    assert_eq!(created.pid, Some(4000));

    let info = c.instance_info("db1").await.unwrap();
    assert_eq!(info.access_key, "AK");
    assert_eq!(info.secret_key, "SK");
    assert_eq!(info.region, "us-east-1");
    assert_eq!(info.endpoint_url, "https://9001.minio.sys.example.com");

    assert_eq!(c.create_instance("db2").await.unwrap().port, 9002);
    let ids: Vec<String> = c
        .list_instances()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.instance_id.to_string())
        .collect();
    assert_eq!(ids, ["db1", "db2"]);

    let out = c.delete_instance("db1").await.unwrap();
    assert!(out.stop_confirmed);
    assert_eq!(out.instance_id.as_str(), "db1");

    assert_status(
        c.instance_info("db1").await.unwrap_err(),
        StatusCode::BAD_REQUEST,
        "not_found",
    );
    assert_eq!(c.create_instance("db3").await.unwrap().port, 9001);
}

#[tokio::test]
async fn client_errors_are_400() {
    let agent = start_agent(1, true).await;
    let c = &agent.client;

    c.create_instance("db1").await.unwrap();
    assert_status(
        c.create_instance("db1").await.unwrap_err(),
        StatusCode::BAD_REQUEST,
        "already_exists",
    );
    // Must not resolve to db1.
    assert_status(
        c.instance_info("db1 ").await.unwrap_err(),
        StatusCode::BAD_REQUEST,
        "invalid_id",
    );
    assert_status(
        c.create_instance("db2").await.unwrap_err(),
        StatusCode::BAD_REQUEST,
        "no_capacity",
    );
    assert_status(
        c.delete_instance("ghost").await.unwrap_err(),
        StatusCode::BAD_REQUEST,
        "not_found",
    );
    assert_status(
        c.create_instance(".hidden").await.unwrap_err(),
        StatusCode::BAD_REQUEST,
        "invalid_id",
    );
}

#[tokio::test]
async fn info_before_credentials_is_503() {
    let agent = start_agent(10, false).await;
    agent.client.create_instance("db1").await.unwrap();
    assert_status(
        agent.client.instance_info("db1").await.unwrap_err(),
        StatusCode::SERVICE_UNAVAILABLE,
        "credentials_unavailable",
    );
}

#[tokio::test]
async fn request_id_is_echoed_or_minted() {
    let agent = start_agent(10, true).await;
    let http = reqwest::Client::new();
    let url = format!("{}/healthz", agent.base);

    let resp = http
        .get(&url)
        .header("x-request-id", "trace-42")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-request-id"], "trace-42");
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["capacity"], 10);
    assert_eq!(body["instances"], 0);

    let resp = http
        .get(format!("{}/instances/nope", agent.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let minted = resp.headers()["x-request-id"].to_str().unwrap();
    assert!(uuid::Uuid::parse_str(minted).is_ok(), "{minted}");
}
