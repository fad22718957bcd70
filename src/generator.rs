//! Documentation text generation.
//!
//! Wraps the language model with four tasks: revising existing docs,
//! authoring a new section, writing a one-line changelog entry, and
//! drafting an initial project overview. Failures are not retried here.
//!
//! [`ContentGenerator::rewrite`] never trusts the model to reproduce the
//! diff: whatever the model writes under a trailing "Relevant Code Changes"
//! heading is discarded and the caller's diff is appended verbatim.

use std::sync::Arc;
use tracing::instrument;

use crate::error::PipelineError;
use crate::llm::LanguageModel;

/// Heading of the diff section appended to every rewrite.
pub const CODE_CHANGES_HEADING: &str = "### Relevant Code Changes";

const REWRITE_SYSTEM: &str = "You are a senior technical writer. Revise the provided \
documentation so it matches the code change. Keep the existing tone, structure and Markdown \
formatting. Return only the revised documentation, with no preamble.";

const CREATE_SYSTEM: &str = "You are a senior technical writer documenting a feature that has \
no existing documentation. Write a concise Markdown section explaining what the feature does \
and how it is used, based on the code change. Return only the section, with no preamble.";

const CHANGELOG_SYSTEM: &str = "You write one-sentence changelog entries. Name the author, the \
single most relevant file from the diff in backticks, and the high-level impact. No line \
numbers, no before/after detail. Return exactly one sentence.";

const SEED_SYSTEM: &str = "You are a senior technical writer bootstrapping documentation for a \
project. From the source code provided, write a Markdown overview covering the project's \
purpose, the main technologies it uses, and how its main components fit together. Return only \
the document, with no preamble.";

#[derive(Clone)]
pub struct ContentGenerator {
    llm: Arc<dyn LanguageModel>,
}

impl ContentGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Revise `old_doc_context` for the change and append `diff` verbatim in
    /// a fenced block as the final section.
    #[instrument(skip_all, fields(model = self.llm.name()))]
    pub async fn rewrite(
        &self,
        summary: &str,
        old_doc_context: &str,
        diff: &str,
    ) -> Result<String, PipelineError> {
        let prompt = format!(
            "Summary of the change:\n{}\n\nCurrent documentation:\n{}\n\nCode change:\n{}\n\n\
             Write the revised documentation.",
            summary,
            old_doc_context,
            fenced("diff", diff)
        );
        let body = self.generate(REWRITE_SYSTEM, &prompt).await?;
        Ok(append_code_changes(&body, diff))
    }

    /// Author a new documentation section for an undocumented change.
    #[instrument(skip_all, fields(model = self.llm.name()))]
    pub async fn create(&self, summary: &str, diff: &str) -> Result<String, PipelineError> {
        let prompt = format!(
            "Summary of the change:\n{}\n\nCode change:\n{}\n\nWrite the new documentation section.",
            summary,
            fenced("diff", diff)
        );
        self.generate(CREATE_SYSTEM, &prompt).await
    }

    /// One changelog sentence attributing the change to `author`.
    pub async fn summarize_changelog(
        &self,
        author: &str,
        summary: &str,
        diff: &str,
    ) -> Result<String, PipelineError> {
        let prompt = format!(
            "Author: {}\nSummary: {}\nCode change:\n{}\n\n\
             Write the sentence in the form: A push by <author> to the file `<file>` has <impact>.",
            author,
            summary,
            fenced("diff", diff)
        );
        let line = self.generate(CHANGELOG_SYSTEM, &prompt).await?;
        Ok(line.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Initial overview document for a project with no documentation yet.
    pub async fn seed_overview(&self, source: &str) -> Result<String, PipelineError> {
        let prompt = format!(
            "Project source code:\n{}\n\nWrite the initial project documentation.",
            fenced("", source)
        );
        self.generate(SEED_SYSTEM, &prompt).await
    }

    async fn generate(&self, system: &str, prompt: &str) -> Result<String, PipelineError> {
        let text = self
            .llm
            .complete(system, prompt)
            .await
            .map_err(|e| PipelineError::Generation(format!("{:#}", e)))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Generation(
                "language model returned empty text".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}

/// Wrap `body` in a code fence longer than any backtick run inside it.
fn fenced(lang: &str, body: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in body.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    let fence = "`".repeat(longest.max(2) + 1);
    format!("{fence}{lang}\n{body}\n{fence}")
}

/// Drop any model-written code-changes section and append `diff` verbatim.
pub fn append_code_changes(text: &str, diff: &str) -> String {
    let body = match text.rfind(CODE_CHANGES_HEADING) {
        Some(pos) => text[..pos].trim_end(),
        None => text.trim_end(),
    };
    let body = body.strip_suffix("---").unwrap_or(body).trim_end();
    format!(
        "{}\n\n---\n\n{}\n{}\n",
        body,
        CODE_CHANGES_HEADING,
        fenced("diff", diff)
    )
}
