//! Webhook ingress server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/webhook/github` | Receive GitHub `pull_request` / `push` deliveries |
//! | `GET`  | `/api/stream/logs` | Server-sent progress feed |
//! | `GET`  | `/api/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Error responses share one shape:
//!
//! ```json
//! { "error": { "code": "forbidden", "message": "invalid webhook signature" } }
//! ```
//!
//! Error codes: `bad_request` (400), `forbidden` (403), `not_found` (404),
//! `internal` (500).
//!
//! # Dispatch
//!
//! An accepted delivery is answered with `202 Accepted` immediately; the
//! run itself executes as an independent task. With a tenant registry,
//! each tenant's runs use that tenant's own index and ledger under
//! `[tenants].knowledge_dir`, opened once and shared by its runs. Progress for every run is
//! published on `/api/stream/logs` with event names `log-trigger`,
//! `log-step`, `log-skip`, `log-action` and `log-error`.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::diff_source::DiffFetcher;
use crate::host::{GitHubHost, RepoHost};
use crate::ingress::{parse_event, verify_signature, Dispatch, IngressEvent};
use crate::pipeline::{self, Services};
use crate::progress::{
    spawn_sink, BroadcastProgress, ProgressEvent, ProgressMode, ProgressReporter, ProgressSender,
    TenantLogProgress,
};
use crate::publish::PublishPipeline;
use crate::tenants::{Base64Codec, TenantRegistry};

/// Builds a repository host for `(repo_full_name, token)`.
pub type HostFactory =
    Arc<dyn Fn(&str, &str) -> anyhow::Result<Arc<dyn RepoHost>> + Send + Sync>;

/// Shared state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct ServerState {
    config: Arc<Config>,
    services: Services,
    secret: Option<Arc<Vec<u8>>>,
    tenants: Option<Arc<RwLock<TenantRegistry>>>,
    tenant_knowledge: Arc<Mutex<HashMap<String, Services>>>,
    default_token: Option<String>,
    hosts: HostFactory,
    progress: ProgressSender,
    feed: broadcast::Sender<ProgressEvent>,
}

impl ServerState {
    /// State with the webhook secret and default publish token read from
    /// the environment variables named in config, and GitHub as the host.
    pub fn new(
        config: Config,
        services: Services,
        progress: ProgressSender,
        feed: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        let secret = std::env::var(&config.server.secret_env)
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| Arc::new(s.into_bytes()));
        let default_token = std::env::var(&config.publish.token_env)
            .ok()
            .filter(|s| !s.is_empty());
        let publish = config.publish.clone();
        let hosts: HostFactory = Arc::new(
            move |repo: &str, token: &str| -> anyhow::Result<Arc<dyn RepoHost>> {
                let host = GitHubHost::new(
                    &publish.api_url,
                    repo,
                    token,
                    &publish.user_agent,
                    publish.timeout_secs,
                )?;
                Ok(Arc::new(host))
            },
        );

        Self {
            config: Arc::new(config),
            services,
            secret,
            tenants: None,
            tenant_knowledge: Arc::new(Mutex::new(HashMap::new())),
            default_token,
            hosts,
            progress,
            feed,
        }
    }

    pub fn with_secret(mut self, secret: Option<&str>) -> Self {
        self.secret = secret.map(|s| Arc::new(s.as_bytes().to_vec()));
        self
    }

    pub fn with_default_token(mut self, token: Option<&str>) -> Self {
        self.default_token = token.map(str::to_string);
        self
    }

    pub fn with_tenants(mut self, registry: TenantRegistry) -> Self {
        self.tenants = Some(Arc::new(RwLock::new(registry)));
        self
    }

    pub fn with_host_factory(mut self, hosts: HostFactory) -> Self {
        self.hosts = hosts;
        self
    }
}

pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/webhook/github", post(handle_github_webhook))
        .route("/api/stream/logs", get(handle_log_stream))
        .route("/api/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the server on `[server].bind` and run until the process exits.
pub async fn run_server(config: &Config, mode: ProgressMode) -> anyhow::Result<()> {
    let services = Services::initialize(config).await?;

    let (feed, _) = broadcast::channel(config.progress.channel_capacity);
    let mut reporters: Vec<Box<dyn ProgressReporter>> =
        vec![Box::new(BroadcastProgress::new(feed.clone()))];
    if let Some(reporter) = mode.reporter() {
        reporters.push(reporter);
    }
    if let Some(dir) = &config.progress.log_dir {
        reporters.push(Box::new(TenantLogProgress::new(dir)));
    }
    let (progress, _sink) = spawn_sink(config.progress.channel_capacity, reporters);

    let mut state = ServerState::new(config.clone(), services, progress, feed);
    if let Some(path) = &config.tenants.registry_path {
        let registry = TenantRegistry::open(path, Arc::new(Base64Codec))?;
        info!(tenants = registry.list().count(), "tenant registry loaded");
        state = state.with_tenants(registry);
    }
    if state.secret.is_none() {
        warn!(
            env = %config.server.secret_env,
            "no webhook secret configured; signatures will not be verified"
        );
    }

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "webhook server listening");
    println!("docsync listening on http://{}", bind_addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

// ============ GET /api/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/webhook/github ============

#[derive(Serialize, Debug)]
struct WebhookResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    change_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Everything a spawned run needs that depends on who owns the repository.
struct RunContext {
    services: Services,
    token: String,
    tenant_id: Option<String>,
}

async fn handle_github_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    if let Some(secret) = &state.secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!("rejected webhook with missing or invalid signature");
            return Err(forbidden("invalid webhook signature"));
        }
    }

    let event_name = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("missing X-GitHub-Event header"))?;
    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid JSON: {}", e)))?;

    let event = match parse_event(event_name, &payload, &state.config.publish.branch_prefix) {
        Dispatch::Ignore(reason) => {
            info!(event = event_name, %reason, "webhook ignored");
            return Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    status: "ignored",
                    change_id: None,
                    reason: Some(reason),
                }),
            ));
        }
        Dispatch::Accept(event) => event,
    };

    let ctx = resolve_run_context(&state, &event.repo_id).await?;
    let change_id = event.change_id.clone();
    info!(repo = %event.repo_id, change_id = %change_id, kind = ?event.kind, "webhook accepted");

    tokio::spawn(execute(state, ctx, event));

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            status: "accepted",
            change_id: Some(change_id),
            reason: None,
        }),
    ))
}

async fn resolve_run_context(state: &ServerState, repo: &str) -> Result<RunContext, AppError> {
    let (token, tenant_id, model) = match &state.tenants {
        Some(registry) => {
            let registry = registry.read().await;
            let record = registry
                .lookup(repo)
                .ok_or_else(|| not_found(format!("repository '{}' is not registered", repo)))?;
            let token = registry
                .token(record)
                .map_err(|e| internal(format!("could not read tenant credentials: {:#}", e)))?;
            (token, Some(record.tenant_id.clone()), record.model.clone())
        }
        None => {
            let token = state
                .default_token
                .clone()
                .ok_or_else(|| internal("no repository token configured"))?;
            (token, None, None)
        }
    };

    let base = match &tenant_id {
        Some(id) => tenant_services(state, id).await?,
        None => state.services.clone(),
    };
    let mut services = match model {
        Some(model) => base
            .for_model_config(&model)
            .map_err(|e| internal(e.to_string()))?,
        None => base,
    };
    let host = (state.hosts)(repo, &token).map_err(|e| internal(format!("{:#}", e)))?;
    services = services.with_publisher(PublishPipeline::new(
        host,
        &state.config.publish.branch_prefix,
        &state.config.knowledge.ledger_source,
    ));

    Ok(RunContext {
        services,
        token,
        tenant_id,
    })
}

/// The tenant's knowledge-scoped services, opened on first use.
async fn tenant_services(state: &ServerState, tenant_id: &str) -> Result<Services, AppError> {
    let mut cache = state.tenant_knowledge.lock().await;
    if let Some(services) = cache.get(tenant_id) {
        return Ok(services.clone());
    }
    let root = state.config.tenants.knowledge_root(&state.config.knowledge);
    let services = state
        .services
        .for_tenant(&root, tenant_id)
        .await
        .map_err(|e| internal(e.to_string()))?;
    cache.insert(tenant_id.to_string(), services.clone());
    Ok(services)
}

async fn execute(state: ServerState, ctx: RunContext, event: IngressEvent) {
    let progress = state
        .progress
        .for_run(&event.change_id, ctx.tenant_id.as_deref());

    let publish = &state.config.publish;
    let diff = match DiffFetcher::new(Some(ctx.token), &publish.user_agent, publish.timeout_secs) {
        Ok(fetcher) => fetcher.resolve(&event.diff_source).await,
        Err(e) => Err(e),
    };
    let diff = match diff {
        Ok(diff) => diff,
        Err(e) => {
            error!(change_id = %event.change_id, error = %e, "could not fetch diff");
            progress.error(format!("Could not fetch diff: {:#}", e));
            return;
        }
    };

    let run = event.into_run(diff);
    let outcome = pipeline::run(&ctx.services, &run, &progress).await;
    info!(change_id = %run.change_id, outcome = outcome.label(), "run finished");
}

// ============ GET /api/stream/logs ============

async fn handle_log_stream(
    State(state): State<ServerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.feed.subscribe()).filter_map(|message| {
        let event = message.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event(event.kind.sse_name()).data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
