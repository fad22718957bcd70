use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn docsync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docsync");
    path
}

/// Knowledge base with three pages plus a config using the offline hash
/// embedder. `llm_url` points the language model at a mock server.
fn setup_test_env(llm_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let kb = root.join("kb");
    fs::create_dir_all(kb.join("guides")).unwrap();
    fs::write(
        kb.join("auth.md"),
        "# Authentication\n\nLogin tokens expire after one hour of inactivity.\n\nRefresh tokens are rotated on every use.",
    )
    .unwrap();
    fs::write(
        kb.join("billing.md"),
        "# Billing\n\nInvoices are generated monthly for each customer account.",
    )
    .unwrap();
    fs::write(
        kb.join("guides").join("deploy.md"),
        "# Deployment\n\nKubernetes manifests and helm charts live under deploy/.",
    )
    .unwrap();
    fs::write(kb.join("notes.txt"), "not markdown, not indexed").unwrap();

    let config_content = format!(
        r#"[knowledge]
docs_root = "{root}/kb"
repo_prefix = "docs/"
ledger_path = "{root}/kb/DOC_LEDGER.md"
index_path = "{root}/data/index.sqlite"

[chunking]
max_chars = 400
overlap_chars = 40

[retrieval]
top_k = 2
confidence_threshold = 0.5

[embedding]
provider = "hash"

[llm]
provider = "ollama"
model = "llama3"
url = "{llm_url}"
max_retries = 0
timeout_secs = 5

[tenants]
registry_path = "{root}/data/tenants.json"
"#,
        root = root.display(),
        llm_url = llm_url,
    );

    let config_path = config_dir.join("docsync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docsync(config_path: &Path, args: &[&str], env: &[(&str, &str)]) -> (String, String, bool) {
    let binary = docsync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .envs(env.iter().copied())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_index_build_counts_markdown_only() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, success) = run_docsync(&config_path, &["index", "build"], &[]);
    assert!(success, "build failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents: 3"));
}

#[test]
fn test_index_query_ranks_matching_page_first() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    run_docsync(&config_path, &["index", "build"], &[]);

    let (stdout, stderr, success) = run_docsync(
        &config_path,
        &["index", "query", "when do login tokens expire", "--json"],
        &[],
    );
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);

    let body: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["chunk"]["source_path"], "docs/auth.md");
    assert!(body["decision"]["mode"] == "UPDATE" || body["decision"]["mode"] == "CREATE");
}

#[test]
fn test_index_query_without_build_fails() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (_, stderr, success) = run_docsync(&config_path, &["index", "query", "anything"], &[]);
    assert!(!success);
    assert!(stderr.contains("index build"), "stderr={}", stderr);
}

#[test]
fn test_index_add_is_incremental() {
    let (tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    run_docsync(&config_path, &["index", "build"], &[]);

    let new_page = tmp.path().join("kb").join("search.md");
    fs::write(&new_page, "# Search\n\nFull text search uses trigram indexes.").unwrap();
    let page = new_page.to_str().unwrap();

    let (stdout, stderr, success) = run_docsync(&config_path, &["index", "add", page], &[]);
    assert!(success, "add failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("chunks added: 1"));

    // Same content again: nothing new to embed.
    let (stdout, _, success) = run_docsync(&config_path, &["index", "add", page], &[]);
    assert!(success);
    assert!(stdout.contains("chunks added: 0"));

    let (stdout, _, _) = run_docsync(
        &config_path,
        &["index", "query", "trigram search indexes", "--k", "1"],
        &[],
    );
    assert!(stdout.contains("docs/search.md"));
}

#[test]
fn test_tenant_add_list_rotate() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let env = [("DOCSYNC_TEST_TOKEN", "ghp_first")];

    let (stdout, stderr, success) = run_docsync(
        &config_path,
        &["tenant", "add", "acme/widgets", "--token-env", "DOCSYNC_TEST_TOKEN"],
        &env,
    );
    assert!(success, "tenant add failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("acme_widgets"));

    let (_, _, success) = run_docsync(
        &config_path,
        &["tenant", "add", "acme/widgets", "--token-env", "DOCSYNC_TEST_TOKEN"],
        &env,
    );
    assert!(!success, "duplicate registration should fail");

    let (stdout, _, success) = run_docsync(&config_path, &["tenant", "list"], &[]);
    assert!(success);
    assert!(stdout.contains("acme/widgets"));
    assert!(!stdout.contains("ghp_first"));

    let (stdout, _, success) = run_docsync(
        &config_path,
        &["tenant", "rotate", "acme_widgets", "--token-env", "DOCSYNC_TEST_TOKEN"],
        &[("DOCSYNC_TEST_TOKEN", "ghp_second")],
    );
    assert!(success);
    assert!(stdout.contains("credentials rotated"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_dry_run_prints_decision_and_writes_nothing() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_string_contains("code reviewer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": {"role": "assistant", "content": "{\"is_functional_change\": true, \"analysis_summary\": \"login tokens now expire after two hours\"}"}
        })))
        .with_priority(1)
        .mount(&llm)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": {"role": "assistant", "content": "# Authentication\n\nLogin tokens expire after two hours."}
        })))
        .mount(&llm)
        .await;

    let (tmp, config_path) = setup_test_env(&llm.uri());
    let diff = tmp.path().join("change.diff");
    fs::write(
        &diff,
        "--- a/src/auth.rs\n+++ b/src/auth.rs\n-const TTL: u64 = 3600;\n+const TTL: u64 = 7200;\n",
    )
    .unwrap();
    let diff = diff.to_str().unwrap().to_string();
    let config = config_path.clone();

    let (stdout, stderr, success) = tokio::task::spawn_blocking(move || {
        run_docsync(
            &config,
            &[
                "run",
                "--diff-file",
                &diff,
                "--title",
                "Extend token lifetime",
                "--change-id",
                "42",
                "--repo",
                "acme/widgets",
                "--dry-run",
            ],
            &[],
        )
    })
    .await
    .unwrap();

    assert!(success, "dry run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("run (dry-run)"));
    assert!(stdout.contains("summary: login tokens now expire after two hours"));
    assert!(stdout.contains("mode: "));
    assert!(stdout.contains("### Relevant Code Changes") || stdout.contains("Login tokens expire after two hours."));
    assert!(!tmp.path().join("kb").join("DOC_LEDGER.md").exists());
}

#[test]
fn test_run_rejects_unregistered_repository() {
    let (tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let diff = tmp.path().join("change.diff");
    fs::write(&diff, "--- a/src/auth.rs\n+++ b/src/auth.rs\n+const TTL: u64 = 7200;\n").unwrap();

    let (stdout, stderr, success) = run_docsync(
        &config_path,
        &[
            "run",
            "--diff-file",
            diff.to_str().unwrap(),
            "--title",
            "Extend token lifetime",
            "--change-id",
            "42",
            "--repo",
            "acme/unknown",
        ],
        &[("GITHUB_API_TOKEN", "ghp_process")],
    );

    assert!(!success, "unregistered repository should be rejected: stdout={}", stdout);
    assert!(stderr.contains("not registered"), "stderr={}", stderr);
    assert!(!tmp.path().join("kb").join("DOC_LEDGER.md").exists());
}
