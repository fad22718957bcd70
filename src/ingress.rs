//! Webhook event parsing.
//!
//! Turns a GitHub webhook delivery into an [`IngressEvent`] or a reason to
//! ignore it. Handled deliveries:
//!
//! | Event | Accepted when | `change_id` | Diff |
//! |-------|---------------|-------------|------|
//! | `pull_request` | `action == "closed"` and `merged` | PR number | `diff_url` |
//! | `push` | not a deletion, not a pipeline branch, has compare URL and head commit | head sha, 7 chars | `compare + ".diff"` |
//!
//! Pushes to branches starting with the pipeline's own branch prefix are
//! ignored so a published update never triggers another run.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::diff_source::DiffSource;
use crate::models::PipelineRun;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Merged,
    Pushed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressEvent {
    pub kind: ChangeKind,
    pub repo_id: String,
    pub change_id: String,
    pub title: String,
    pub author: String,
    pub diff_source: DiffSource,
}

impl IngressEvent {
    /// Pair the event with its resolved diff.
    pub fn into_run(self, diff: String) -> PipelineRun {
        PipelineRun {
            diff,
            title: self.title,
            repo_id: self.repo_id,
            change_id: self.change_id,
            author: self.author,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Accept(IngressEvent),
    Ignore(String),
}

/// Check an `X-Hub-Signature-256` header (`sha256=<hex>`) against the
/// body. The comparison is constant-time.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the `X-Hub-Signature-256` header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn str_at<'a>(payload: &'a Value, pointer: &str) -> Option<&'a str> {
    payload.pointer(pointer).and_then(|v| v.as_str())
}

/// Decide what to do with a delivery of type `event_name`.
pub fn parse_event(event_name: &str, payload: &Value, branch_prefix: &str) -> Dispatch {
    let Some(repo_id) = str_at(payload, "/repository/full_name") else {
        return Dispatch::Ignore("payload has no repository.full_name".to_string());
    };

    match event_name {
        "pull_request" => parse_pull_request(payload, repo_id),
        "push" => parse_push(payload, repo_id, branch_prefix),
        other => Dispatch::Ignore(format!("unhandled event type '{}'", other)),
    }
}

fn parse_pull_request(payload: &Value, repo_id: &str) -> Dispatch {
    let action = str_at(payload, "/action").unwrap_or_default();
    let merged = payload
        .pointer("/pull_request/merged")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if action != "closed" || !merged {
        return Dispatch::Ignore(format!("pull request action '{}' is not a merge", action));
    }

    let Some(number) = payload.pointer("/pull_request/number").and_then(|v| v.as_u64()) else {
        return Dispatch::Ignore("pull request has no number".to_string());
    };
    let Some(diff_url) = str_at(payload, "/pull_request/diff_url") else {
        return Dispatch::Ignore("pull request has no diff_url".to_string());
    };

    Dispatch::Accept(IngressEvent {
        kind: ChangeKind::Merged,
        repo_id: repo_id.to_string(),
        change_id: number.to_string(),
        title: str_at(payload, "/pull_request/title")
            .unwrap_or("untitled pull request")
            .to_string(),
        author: str_at(payload, "/pull_request/user/login")
            .unwrap_or("unknown")
            .to_string(),
        diff_source: DiffSource::Url(diff_url.to_string()),
    })
}

fn parse_push(payload: &Value, repo_id: &str, branch_prefix: &str) -> Dispatch {
    if payload.get("deleted").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Dispatch::Ignore("branch deletion".to_string());
    }

    let git_ref = str_at(payload, "/ref").unwrap_or_default();
    let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
    if branch.starts_with(branch_prefix) {
        return Dispatch::Ignore(format!("push to pipeline branch '{}'", branch));
    }

    let Some(compare) = str_at(payload, "/compare").filter(|c| !c.is_empty()) else {
        return Dispatch::Ignore("push has no compare URL".to_string());
    };
    let Some(head_id) = str_at(payload, "/head_commit/id") else {
        return Dispatch::Ignore("push has no head commit".to_string());
    };

    let title = str_at(payload, "/head_commit/message")
        .and_then(|m| m.lines().next())
        .unwrap_or("push")
        .to_string();
    let author = str_at(payload, "/pusher/name")
        .or_else(|| str_at(payload, "/sender/login"))
        .unwrap_or("unknown")
        .to_string();

    Dispatch::Accept(IngressEvent {
        kind: ChangeKind::Pushed,
        repo_id: repo_id.to_string(),
        change_id: head_id.chars().take(7).collect(),
        title,
        author,
        diff_source: DiffSource::Url(format!("{}.diff", compare)),
    })
}
