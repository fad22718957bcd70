//! Diff classification.
//!
//! Asks the language model whether a diff changes observable behavior and
//! for a one-line summary of what changed. The summary doubles as the
//! retrieval query, so it is returned verbatim.

use std::sync::Arc;
use tracing::{instrument, warn};

use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::models::ClassificationVerdict;

const SYSTEM_PROMPT: &str = "You are an expert code reviewer. You decide whether a code change \
alters functionality (new features, changed behavior, changed APIs or configuration) or is \
trivial (comments, formatting, typo fixes, refactors with no behavior change). \
Reply with a single JSON object and nothing else.";

/// Structurally invalid replies are retried this many extra times.
const MALFORMED_RETRIES: usize = 1;

#[derive(Clone)]
pub struct ChangeClassifier {
    llm: Arc<dyn LanguageModel>,
}

impl ChangeClassifier {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Classify `diff`.
    ///
    /// A reply that is not a JSON object with both fields is retried once.
    /// A transport failure is not retried here; the HTTP layer already
    /// backs off on transient errors.
    #[instrument(skip_all, fields(model = self.llm.name(), diff_len = diff.len()))]
    pub async fn classify(&self, diff: &str) -> Result<ClassificationVerdict, PipelineError> {
        let prompt = build_prompt(diff);
        let mut last_problem = String::new();

        for attempt in 0..=MALFORMED_RETRIES {
            let reply = self
                .llm
                .complete(SYSTEM_PROMPT, &prompt)
                .await
                .map_err(|e| PipelineError::Classification(format!("{:#}", e)))?;

            match parse_verdict(&reply) {
                Ok(verdict) => return Ok(verdict),
                Err(problem) => {
                    warn!(attempt, %problem, "malformed classification reply");
                    last_problem = problem;
                }
            }
        }

        Err(PipelineError::Classification(format!(
            "malformed verdict after retry: {}",
            last_problem
        )))
    }
}

fn build_prompt(diff: &str) -> String {
    format!(
        "Analyze the following code diff.\n\n\
         Respond with JSON of the form \
         {{\"is_functional_change\": <true|false>, \"analysis_summary\": \"<one sentence describing the change>\"}}.\n\n\
         Diff:\n{}",
        diff
    )
}

/// Parse a verdict out of a model reply.
///
/// Accepts a bare JSON object or one wrapped in a fenced code block or
/// surrounded by prose. Both fields are required and the summary must be
/// non-empty.
pub fn parse_verdict(reply: &str) -> Result<ClassificationVerdict, String> {
    let json = extract_json_object(reply).ok_or_else(|| "no JSON object in reply".to_string())?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON: {}", e))?;

    let is_functional_change = value
        .get("is_functional_change")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| "missing boolean field 'is_functional_change'".to_string())?;
    let analysis_summary = value
        .get("analysis_summary")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing field 'analysis_summary'".to_string())?
        .to_string();

    Ok(ClassificationVerdict {
        is_functional_change,
        analysis_summary,
    })
}

fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<anyhow::Result<String>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<anyhow::Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _system: &str, _prompt: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies.lock().unwrap().remove(0)
        }
    }

    #[test]
    fn test_parse_fenced_reply() {
        let reply = "```json\n{\"is_functional_change\": true, \"analysis_summary\": \"Adds a profile endpoint\"}\n```";
        let verdict = parse_verdict(reply).unwrap();
        assert!(verdict.is_functional_change);
        assert_eq!(verdict.analysis_summary, "Adds a profile endpoint");
    }

    #[test]
    fn test_parse_missing_field() {
        let err = parse_verdict("{\"is_functional_change\": false}").unwrap_err();
        assert!(err.contains("analysis_summary"));
        assert!(parse_verdict("no json here").is_err());
    }

    #[tokio::test]
    async fn test_retries_once_on_malformed_reply() {
        let llm = Scripted::new(vec![
            Ok("{\"analysis_summary\": \"x\"}".to_string()),
            Ok("{\"is_functional_change\": false, \"analysis_summary\": \"Comment tweak\"}".to_string()),
        ]);
        let verdict = ChangeClassifier::new(llm.clone()).classify("diff").await.unwrap();
        assert!(!verdict.is_functional_change);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fails_after_second_malformed_reply() {
        let llm = Scripted::new(vec![
            Ok("nope".to_string()),
            Ok("still nope".to_string()),
            Ok("{\"is_functional_change\": true, \"analysis_summary\": \"late\"}".to_string()),
        ]);
        let err = ChangeClassifier::new(llm.clone()).classify("diff").await.unwrap_err();
        assert_eq!(err.kind(), "classification");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transport_error_not_retried() {
        let llm = Scripted::new(vec![Err(anyhow::anyhow!("connection reset"))]);
        let err = ChangeClassifier::new(llm.clone()).classify("diff").await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }
}
