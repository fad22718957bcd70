//! Run progress reporting.
//!
//! Every run reports what it is doing (triggered, each stage, skips,
//! publish actions, errors) as [`ProgressEvent`]s. Events travel over a
//! bounded channel to a single sink task that hands them to each
//! configured [`ProgressReporter`]:
//!
//! - [`StderrProgress`]: human-readable lines on stderr
//! - [`JsonProgress`]: one JSON object per line on stderr
//! - [`BroadcastProgress`]: a broadcast feed consumed by the SSE endpoint
//! - [`TenantLogProgress`]: one append-only log file per tenant
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts.
//! Emitting never blocks a run: when the channel is full the event is
//! dropped and a warning is logged.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Trigger,
    Step,
    Skip,
    Action,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Trigger => "trigger",
            EventKind::Step => "step",
            EventKind::Skip => "skip",
            EventKind::Action => "action",
            EventKind::Error => "error",
        }
    }

    /// SSE event name, e.g. `log-step`.
    pub fn sse_name(&self) -> String {
        format!("log-{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub change_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub kind: EventKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Receives progress events on the sink thread.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: `[a1b2c3d] step  Retrieving related docs`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let line = format!(
            "[{}] {:<7} {}\n",
            event.change_id,
            event.kind.as_str(),
            event.message
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// Republishes events on a broadcast channel. Having no subscribers is
/// not an error.
pub struct BroadcastProgress {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgress {
    pub fn new(tx: broadcast::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Appends `[timestamp] [KIND] message` lines to `<dir>/<tenant>.log`.
/// Events without a tenant go to `default.log`.
pub struct TenantLogProgress {
    dir: PathBuf,
}

impl TenantLogProgress {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn append(&self, event: &ProgressEvent) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let name = event.tenant.as_deref().unwrap_or("default");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(format!("{}.log", name)))?;
        writeln!(
            file,
            "[{}] [{}] [{}] {}",
            event.at.format("%Y-%m-%d %H:%M:%S"),
            event.kind.as_str().to_uppercase(),
            event.change_id,
            event.message
        )
    }
}

impl ProgressReporter for TenantLogProgress {
    fn report(&self, event: &ProgressEvent) {
        if let Err(e) = self.append(event) {
            warn!(dir = %self.dir.display(), error = %e, "failed to write tenant log");
        }
    }
}

/// Handle runs use to emit progress. Cheap to clone; a disabled sender
/// drops everything.
#[derive(Clone, Debug)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    change_id: String,
    tenant: Option<String>,
}

impl ProgressSender {
    pub fn disabled() -> Self {
        Self {
            tx: None,
            change_id: String::new(),
            tenant: None,
        }
    }

    /// A sender that stamps events with this run's change id and tenant.
    pub fn for_run(&self, change_id: &str, tenant: Option<&str>) -> Self {
        Self {
            tx: self.tx.clone(),
            change_id: change_id.to_string(),
            tenant: tenant.map(str::to_string),
        }
    }

    pub fn emit(&self, kind: EventKind, message: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = ProgressEvent {
            change_id: self.change_id.clone(),
            tenant: self.tenant.clone(),
            kind,
            message: message.into(),
            at: Utc::now(),
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            warn!(change_id = %event.change_id, "progress channel full, dropping event");
        }
    }

    pub fn trigger(&self, message: impl Into<String>) {
        self.emit(EventKind::Trigger, message);
    }
    pub fn step(&self, message: impl Into<String>) {
        self.emit(EventKind::Step, message);
    }
    pub fn skip(&self, message: impl Into<String>) {
        self.emit(EventKind::Skip, message);
    }
    pub fn action(&self, message: impl Into<String>) {
        self.emit(EventKind::Action, message);
    }
    pub fn error(&self, message: impl Into<String>) {
        self.emit(EventKind::Error, message);
    }
}

/// Start the sink. Reporters run on the blocking pool so file and
/// terminal writes never stall the async executor. The sink exits once
/// every sender has been dropped.
pub fn spawn_sink(
    capacity: usize,
    reporters: Vec<Box<dyn ProgressReporter>>,
) -> (ProgressSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        while let Some(event) = rx.blocking_recv() {
            for reporter in &reporters {
                reporter.report(&event);
            }
        }
    });
    let sender = ProgressSender {
        tx: Some(tx),
        change_id: String::new(),
        tenant: None,
    };
    (sender, handle)
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Terminal reporter for this mode, if any.
    pub fn reporter(&self) -> Option<Box<dyn ProgressReporter>> {
        match self {
            ProgressMode::Off => None,
            ProgressMode::Human => Some(Box::new(StderrProgress)),
            ProgressMode::Json => Some(Box::new(JsonProgress)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<ProgressEvent>>>);

    impl ProgressReporter for Collect {
        fn report(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order_and_stamps_run() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (sender, handle) = spawn_sink(
            16,
            vec![Box::new(Collect(seen.clone())) as Box<dyn ProgressReporter>],
        );
        let run = sender.for_run("a1b2c3d", Some("acme_widgets"));
        run.trigger("New push");
        run.step("Classifying");
        run.skip("Trivial change");
        drop(run);
        drop(sender);
        handle.await.unwrap();

        let events = seen.lock().unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Trigger, EventKind::Step, EventKind::Skip]);
        assert!(events.iter().all(|e| e.change_id == "a1b2c3d"));
        assert_eq!(events[0].tenant.as_deref(), Some("acme_widgets"));
    }

    #[test]
    fn test_disabled_sender_is_silent() {
        ProgressSender::disabled().error("nobody listens");
    }

    #[test]
    fn test_sse_names() {
        assert_eq!(EventKind::Trigger.sse_name(), "log-trigger");
        assert_eq!(EventKind::Error.sse_name(), "log-error");
    }

    #[test]
    fn test_tenant_log_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let reporter = TenantLogProgress::new(tmp.path());
        reporter.report(&ProgressEvent {
            change_id: "42".to_string(),
            tenant: Some("acme_widgets".to_string()),
            kind: EventKind::Action,
            message: "Opened pull request".to_string(),
            at: Utc::now(),
        });
        let log = std::fs::read_to_string(tmp.path().join("acme_widgets.log")).unwrap();
        assert!(log.contains("[ACTION] [42] Opened pull request"));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("loud"), None);
        assert!(ProgressMode::Off.reporter().is_none());
    }
}
