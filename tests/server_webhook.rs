mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;
use docsync::config::Config;
use docsync::host::{InMemoryHost, RepoHost};
use docsync::ingress::sign;
use docsync::progress::{
    spawn_sink, BroadcastProgress, EventKind, ProgressEvent, ProgressReporter, ProgressSender,
};
use docsync::server::{router, HostFactory, ServerState};
use docsync::tenants::{Base64Codec, TenantRegistry};

const SECRET: &str = "s3cret";

struct Harness {
    addr: String,
    host: Arc<InMemoryHost>,
    events: broadcast::Receiver<ProgressEvent>,
    progress: ProgressSender,
    tmp: TempDir,
}

fn config(tmp: &TempDir) -> Config {
    let root = tmp.path().display();
    toml::from_str(&format!(
        r#"
[knowledge]
docs_root = "{root}/docs"
ledger_path = "{root}/DOC_LEDGER.md"
index_path = "{root}/index.sqlite"

[llm]
provider = "ollama"
model = "llama3"
"#
    ))
    .unwrap()
}

async fn start(configure: impl FnOnce(ServerState, &TempDir) -> ServerState) -> Harness {
    let tmp = TempDir::new().unwrap();
    let services = services(
        tmp.path(),
        &[],
        ScriptedModel::functional("profile endpoint returns the user profile"),
        settings(),
    )
    .await;

    let (feed, events) = broadcast::channel(256);
    let reporters: Vec<Box<dyn ProgressReporter>> =
        vec![Box::new(BroadcastProgress::new(feed.clone()))];
    let (progress, _sink) = spawn_sink(256, reporters);

    let host = Arc::new(InMemoryHost::new("acme/widgets", "main"));
    let shared = host.clone();
    let hosts: HostFactory =
        Arc::new(move |_repo: &str, _token: &str| -> anyhow::Result<Arc<dyn RepoHost>> {
            Ok(shared.clone())
        });

    let state = ServerState::new(config(&tmp), services, progress.clone(), feed)
        .with_secret(Some(SECRET))
        .with_default_token(Some("ghp_default"))
        .with_host_factory(hosts);
    let state = configure(state, &tmp);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    Harness {
        addr,
        host,
        events,
        progress,
        tmp,
    }
}

async fn deliver(addr: &str, event: &str, payload: &Value, secret: Option<&str>) -> reqwest::Response {
    let body = serde_json::to_vec(payload).unwrap();
    let mut request = reqwest::Client::new()
        .post(format!("http://{}/api/webhook/github", addr))
        .header("X-GitHub-Event", event)
        .header("Content-Type", "application/json");
    if let Some(secret) = secret {
        request = request.header(
            "X-Hub-Signature-256",
            sign(secret.as_bytes(), &body).unwrap(),
        );
    }
    request.body(body).send().await.unwrap()
}

fn merged_pr(repo: &str, diff_url: &str) -> Value {
    json!({
        "action": "closed",
        "pull_request": {
            "merged": true,
            "number": 42,
            "title": "Add profile endpoint",
            "user": {"login": "octocat"},
            "diff_url": diff_url
        },
        "repository": {"full_name": repo}
    })
}

#[tokio::test]
async fn test_health() {
    let harness = start(|s, _| s).await;
    let body: Value = reqwest::get(format!("http://{}/api/health", harness.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_bad_signature_rejected() {
    let harness = start(|s, _| s).await;
    let payload = merged_pr("acme/widgets", "http://unused/42.diff");

    let resp = deliver(&harness.addr, "pull_request", &payload, Some("wrong")).await;
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "forbidden");

    let resp = deliver(&harness.addr, "pull_request", &payload, None).await;
    assert_eq!(resp.status(), 403);
    assert_eq!(harness.host.call_count(), 0);
}

#[tokio::test]
async fn test_unhandled_event_ignored() {
    let harness = start(|s, _| s).await;
    let payload = json!({"zen": "hi", "repository": {"full_name": "acme/widgets"}});

    let resp = deliver(&harness.addr, "ping", &payload, Some(SECRET)).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn test_unregistered_repository_not_found() {
    let harness = start(|state, tmp| {
        let mut registry =
            TenantRegistry::open(&tmp.path().join("tenants.json"), Arc::new(Base64Codec)).unwrap();
        registry.register("acme/widgets", "ghp_tenant", None).unwrap();
        state.with_tenants(registry)
    })
    .await;

    let payload = merged_pr("acme/other", "http://unused/42.diff");
    let resp = deliver(&harness.addr, "pull_request", &payload, Some(SECRET)).await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_merged_pull_request_runs_to_a_pull_request() {
    let mut harness = start(|s, _| s).await;
    let github = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/widgets/pull/42.diff"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FUNCTIONAL_DIFF))
        .mount(&github)
        .await;

    let payload = merged_pr(
        "acme/widgets",
        &format!("{}/acme/widgets/pull/42.diff", github.uri()),
    );
    let resp = deliver(&harness.addr, "pull_request", &payload, Some(SECRET)).await;
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["change_id"], "42");

    let mut waited = Duration::ZERO;
    while harness.host.pull_requests().is_empty() && waited < Duration::from_secs(10) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    let prs = harness.host.pull_requests();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].head, "ai-docs-fix-pr-42");
    assert!(harness.tmp.path().join("DOC_LEDGER.md").exists());

    let first = tokio::time::timeout(Duration::from_secs(5), harness.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.kind, EventKind::Trigger);
    assert_eq!(first.change_id, "42");
}

#[tokio::test]
async fn test_tenant_runs_use_their_own_knowledge() {
    let harness = start(|state, tmp| {
        let mut registry =
            TenantRegistry::open(&tmp.path().join("tenants.json"), Arc::new(Base64Codec)).unwrap();
        registry.register("acme/widgets", "ghp_tenant", None).unwrap();
        state.with_tenants(registry)
    })
    .await;
    let github = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/widgets/pull/42.diff"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FUNCTIONAL_DIFF))
        .mount(&github)
        .await;

    let payload = merged_pr(
        "acme/widgets",
        &format!("{}/acme/widgets/pull/42.diff", github.uri()),
    );
    let resp = deliver(&harness.addr, "pull_request", &payload, Some(SECRET)).await;
    assert_eq!(resp.status(), 202);

    let mut waited = Duration::ZERO;
    while harness.host.pull_requests().is_empty() && waited < Duration::from_secs(10) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    assert_eq!(harness.host.pull_requests().len(), 1);

    let tenant_dir = harness.tmp.path().join("tenants").join("acme_widgets");
    assert!(tenant_dir.join("DOC_LEDGER.md").exists());
    assert!(tenant_dir.join("index.sqlite").exists());
    assert!(!harness.tmp.path().join("DOC_LEDGER.md").exists());
}

#[tokio::test]
async fn test_log_stream_emits_named_events() {
    let harness = start(|s, _| s).await;
    let mut resp = reqwest::get(format!("http://{}/api/stream/logs", harness.addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    harness.progress.for_run("7", None).step("Analyzing diff");

    let mut seen = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        while !seen.contains("Analyzing diff") {
            match resp.chunk().await.unwrap() {
                Some(bytes) => seen.push_str(&String::from_utf8_lossy(&bytes)),
                None => break,
            }
        }
    })
    .await;
    assert!(read.is_ok(), "no event within timeout; got {:?}", seen);
    assert!(seen.contains("event: log-step"));
    assert!(seen.contains("\"change_id\":\"7\""));
}
