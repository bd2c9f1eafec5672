use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chatlog_common::protocol::http::{
    MessageEnvelope, MessagesPage, PushResponse, PushStatus, TargetsEnvelope,
};
use chatlog_daemon::config::{DaemonConfig, SyncConfig, TargetConfig};
use chatlog_daemon::runtime;
use chatlog_daemon::sync::{
    CommitError, CommitReceipt, CommitRequest, RemoteRepositoryClient, TargetSpec,
};
use serde_json::json;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Accepts every commit except those for targets listed in `rejected`.
#[derive(Default)]
struct FakeRemote {
    rejected: Vec<String>,
    commits: Mutex<Vec<(String, CommitRequest)>>,
}

impl RemoteRepositoryClient for FakeRemote {
    fn commit(
        &self,
        target: &TargetSpec,
        request: CommitRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CommitReceipt, CommitError>> + Send>> {
        let result = if self.rejected.contains(&target.name) {
            Err(CommitError::Auth { reason: "token revoked".to_string() })
        } else {
            let mut commits = self.commits.lock().expect("commit lock should not be poisoned");
            commits.push((target.name.clone(), request));
            Ok(CommitReceipt::single(format!("sha-{}", commits.len())))
        };
        Box::pin(async move { result })
    }
}

fn target_config(name: &str) -> TargetConfig {
    TargetConfig {
        name: name.to_string(),
        owner: "octo".to_string(),
        repo: format!("chat-{name}"),
        branch: "main".to_string(),
        path_prefix: "/logs/".to_string(),
    }
}

struct RunningDaemon {
    base_url: String,
    shutdown: oneshot::Sender<()>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
    http: reqwest::Client,
}

impl RunningDaemon {
    async fn start(config: DaemonConfig, remote: Arc<FakeRemote>) -> Self {
        let engine = runtime::open_engine(&config, remote).expect("engine should open");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            runtime::serve(listener, &config, engine, async move {
                let _ = shutdown_rx.await;
            })
            .await
        });

        Self { base_url: format!("http://{addr}"), shutdown, server, http: reqwest::Client::new() }
    }

    async fn push(&self) -> PushResponse {
        self.http
            .post(format!("{}/push", self.base_url))
            .send()
            .await
            .expect("push request should be sent")
            .json()
            .await
            .expect("push response should decode")
    }

    async fn stop(self) {
        self.shutdown.send(()).expect("server should still be running");
        self.server
            .await
            .expect("server task should not panic")
            .expect("server should shut down cleanly");
    }
}

fn config_for(db_dir: &std::path::Path, targets: Vec<TargetConfig>) -> DaemonConfig {
    DaemonConfig {
        db_path: Some(db_dir.join("messages.db")),
        sync: SyncConfig {
            // Keep the scheduler quiet so `/push` drives every run.
            sweep_interval_sec: 3_600,
            sync_on_append: false,
            ..SyncConfig::default()
        },
        targets,
        ..DaemonConfig::default()
    }
}

#[tokio::test]
async fn messages_flow_from_http_into_commits() {
    let tmp = tempdir().expect("tempdir should be created");
    let remote = Arc::new(FakeRemote::default());
    let daemon =
        RunningDaemon::start(config_for(tmp.path(), vec![target_config("main")]), Arc::clone(&remote))
            .await;

    let health = daemon
        .http
        .get(format!("{}/healthz", daemon.base_url))
        .send()
        .await
        .expect("health request should be sent");
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert!(health.headers().contains_key("x-request-id"));

    let mut ids = Vec::new();
    for content in ["first", "second", "third"] {
        let response = daemon
            .http
            .post(format!("{}/messages", daemon.base_url))
            .json(&json!({ "content": content }))
            .send()
            .await
            .expect("create request should be sent");
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let envelope: MessageEnvelope = response.json().await.expect("envelope should decode");
        assert_eq!(envelope.message.content, content);
        assert_eq!(envelope.message.delivery("main").map(|d| d.kind()), Some("pending"));
        ids.push(envelope.message.id);
    }

    // The scheduler's startup sweep can still be finishing and absorb the
    // first push, so allow one more.
    let mut push = daemon.push().await;
    if push.status == PushStatus::Partial {
        push = daemon.push().await;
    }
    assert_eq!(push.status, PushStatus::Success, "{}", push.message);
    assert_eq!(push.results["main"].cursor, ids.last().copied());

    let page: MessagesPage = daemon
        .http
        .get(format!("{}/messages", daemon.base_url))
        .send()
        .await
        .expect("list request should be sent")
        .json()
        .await
        .expect("page should decode");
    assert_eq!(page.messages.iter().map(|m| m.id).collect::<Vec<_>>(), ids);
    assert!(page.messages.iter().all(|m| m.fully_delivered()));

    let commits = remote.commits.lock().expect("commit lock should not be poisoned").clone();
    let files: Vec<_> = commits.iter().flat_map(|(_, request)| request.files.clone()).collect();
    assert_eq!(files.len(), 3);
    assert!(files.iter().all(|file| file.path.starts_with("logs/")));

    let since: MessagesPage = daemon
        .http
        .get(format!("{}/messages?since={}", daemon.base_url, ids[0]))
        .send()
        .await
        .expect("list request should be sent")
        .json()
        .await
        .expect("page should decode");
    assert_eq!(since.messages.len(), 2);

    daemon.stop().await;
}

#[tokio::test]
async fn failing_target_is_reported_and_can_be_resumed() {
    let tmp = tempdir().expect("tempdir should be created");
    let remote = Arc::new(FakeRemote { rejected: vec!["mirror".to_string()], ..FakeRemote::default() });
    let daemon = RunningDaemon::start(
        config_for(tmp.path(), vec![target_config("main"), target_config("mirror")]),
        Arc::clone(&remote),
    )
    .await;

    let blank = daemon
        .http
        .post(format!("{}/messages", daemon.base_url))
        .json(&json!({ "content": "  " }))
        .send()
        .await
        .expect("create request should be sent");
    assert_eq!(blank.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = blank.json().await.expect("error body should decode");
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "VALIDATION_FAILED");

    daemon
        .http
        .post(format!("{}/messages", daemon.base_url))
        .json(&json!({ "content": "hello" }))
        .send()
        .await
        .expect("create request should be sent");

    let push = daemon.push().await;
    assert_eq!(push.status, PushStatus::Partial);
    assert_eq!(push.results["main"].outcome, "committed");
    assert_eq!(push.results["mirror"].outcome, "failed");
    assert!(push.results["mirror"].error.is_some());

    let targets: TargetsEnvelope = daemon
        .http
        .get(format!("{}/targets", daemon.base_url))
        .send()
        .await
        .expect("targets request should be sent")
        .json()
        .await
        .expect("targets should decode");
    let mirror = targets.targets.iter().find(|t| t.name == "mirror").expect("mirror listed");
    assert!(mirror.suspended);
    assert!(!mirror.healthy);
    assert_eq!(mirror.pending, 1);
    assert_eq!(mirror.path_prefix, "logs");

    let resumed = daemon
        .http
        .post(format!("{}/targets/mirror/resume", daemon.base_url))
        .send()
        .await
        .expect("resume request should be sent");
    assert_eq!(resumed.status(), reqwest::StatusCode::OK);

    let missing = daemon
        .http
        .post(format!("{}/targets/nope/resume", daemon.base_url))
        .send()
        .await
        .expect("resume request should be sent");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    daemon.stop().await;
}
