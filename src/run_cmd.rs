//! `docsync run`: process one change from the command line.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::host::GitHubHost;
use crate::models::PipelineRun;
use crate::pipeline::{self, Drafted, RunOutcome, Services, SkipReason};
use crate::progress::ProgressSender;
use crate::publish::PublishPipeline;
use crate::tenants::{Base64Codec, TenantRegistry};

pub struct RunArgs {
    pub diff_file: PathBuf,
    pub title: String,
    pub change_id: String,
    pub repo: String,
    pub author: String,
    pub dry_run: bool,
}

/// Token and services for publishing to `repo`. With a registry
/// configured the repository must be registered, and its run uses the
/// tenant's own index, ledger and model. Without one the process defaults
/// apply.
async fn credentials(config: &Config, services: &Services, repo: &str) -> Result<(String, Services)> {
    let Some(path) = &config.tenants.registry_path else {
        let token = std::env::var(&config.publish.token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .with_context(|| format!("{} environment variable not set", config.publish.token_env))?;
        return Ok((token, services.clone()));
    };

    let registry = TenantRegistry::open(path, Arc::new(Base64Codec))?;
    let record = registry.lookup(repo).with_context(|| {
        format!(
            "repository '{}' is not registered; add it with `docsync tenant add {}`",
            repo, repo
        )
    })?;
    let token = registry.token(record)?;
    let root = config.tenants.knowledge_root(&config.knowledge);
    let scoped = services.for_tenant(&root, &record.tenant_id).await?;
    let services = match &record.model {
        Some(model) => scoped.for_model_config(model)?,
        None => scoped,
    };
    Ok((token, services))
}

pub async fn run_change(config: &Config, args: RunArgs, progress: &ProgressSender) -> Result<()> {
    let diff = std::fs::read_to_string(&args.diff_file)
        .with_context(|| format!("Failed to read diff file: {}", args.diff_file.display()))?;
    let run = PipelineRun {
        diff,
        title: args.title,
        repo_id: args.repo,
        change_id: args.change_id,
        author: args.author,
    };
    let progress = progress.for_run(&run.change_id, None);
    let services = Services::initialize(config).await?;

    if args.dry_run {
        progress.trigger(format!("Dry run for change {} in {}", run.change_id, run.repo_id));
        return match pipeline::draft(&services, &run, &progress).await? {
            Drafted::Skip(reason) => {
                println!("run (dry-run)");
                println!("  outcome: skipped");
                println!("  reason: {}", describe_skip(&reason));
                Ok(())
            }
            Drafted::Ready(draft) => {
                println!("run (dry-run)");
                println!("  summary: {}", draft.verdict.analysis_summary);
                println!("  mode: {}", draft.decision.mode);
                println!("  confidence: {:.3}", draft.decision.confidence);
                for target in &draft.decision.target_sources {
                    println!("  target: {}", target);
                }
                println!();
                println!("{}", draft.doc.text);
                Ok(())
            }
        };
    }

    let (token, services) = credentials(config, &services, &run.repo_id).await?;
    let publish = &config.publish;
    let host = GitHubHost::new(
        &publish.api_url,
        &run.repo_id,
        &token,
        &publish.user_agent,
        publish.timeout_secs,
    )?;
    let services = services.with_publisher(PublishPipeline::new(
        Arc::new(host),
        &publish.branch_prefix,
        &config.knowledge.ledger_source,
    ));

    let outcome = pipeline::run(&services, &run, &progress).await;
    println!("run");
    println!("  outcome: {}", outcome.label());
    match outcome {
        RunOutcome::Published(published) => {
            println!("  mode: {}", published.decision.mode);
            println!("  confidence: {:.3}", published.decision.confidence);
            println!("  pull request: {}", published.pull_request.url);
            println!("  files: {}", published.pull_request.updated_files.join(", "));
            if let Some(line) = &published.changelog {
                println!("  changelog: {}", line);
            }
            if let Some(err) = &published.index_error {
                println!("  warning: index not updated: {}", err);
            }
            Ok(())
        }
        RunOutcome::Skipped(reason) => {
            println!("  reason: {}", describe_skip(&reason));
            Ok(())
        }
        RunOutcome::Failed(e) => bail!("run failed ({}): {}", e.kind(), e),
    }
}

fn describe_skip(reason: &SkipReason) -> String {
    match reason {
        SkipReason::TrivialChange { summary } => format!("trivial change: {}", summary),
        SkipReason::LowConfidence { confidence } => {
            format!("low confidence ({:.3}) and new sections are disabled", confidence)
        }
        SkipReason::NothingToPublish { branch_name } => {
            format!("no files could be written to {}", branch_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_skip() {
        assert_eq!(
            describe_skip(&SkipReason::TrivialChange {
                summary: "fix typo".to_string()
            }),
            "trivial change: fix typo"
        );
        assert!(describe_skip(&SkipReason::LowConfidence { confidence: 0.25 }).contains("0.250"));
    }
}
