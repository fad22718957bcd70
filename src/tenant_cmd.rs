//! `docsync tenant` subcommands.
//!
//! Tokens are never taken on the command line; each command names the
//! environment variable holding the token instead.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, LlmConfig};
use crate::tenants::{Base64Codec, TenantRegistry};

fn open_registry(config: &Config) -> Result<TenantRegistry> {
    let path = config
        .tenants
        .registry_path
        .as_deref()
        .context("No tenant registry configured. Set [tenants] registry_path in config.")?;
    open_at(path)
}

fn open_at(path: &Path) -> Result<TenantRegistry> {
    TenantRegistry::open(path, Arc::new(Base64Codec))
}

fn read_token(env_var: &str) -> Result<String> {
    std::env::var(env_var)
        .ok()
        .filter(|t| !t.is_empty())
        .with_context(|| format!("{} environment variable not set", env_var))
}

/// Model override built from the process default with the given provider
/// and model swapped in.
fn model_override(config: &Config, provider: Option<String>, model: Option<String>) -> Option<LlmConfig> {
    if provider.is_none() && model.is_none() {
        return None;
    }
    let mut llm = config.llm.clone();
    if let Some(provider) = provider {
        llm.provider = provider;
    }
    if let Some(model) = model {
        llm.model = model;
    }
    Some(llm)
}

pub fn run_add(
    config: &Config,
    repo: &str,
    token_env: Option<&str>,
    provider: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let token = read_token(token_env.unwrap_or(&config.publish.token_env))?;
    let mut registry = open_registry(config)?;
    let record = registry.register(repo, &token, model_override(config, provider, model))?;
    println!("tenant add");
    println!("  tenant: {}", record.tenant_id);
    println!("  repository: {}", record.repo_full_name);
    Ok(())
}

pub fn run_list(config: &Config) -> Result<()> {
    let registry = open_registry(config)?;
    if registry.is_empty() {
        println!("No tenants registered.");
        return Ok(());
    }
    println!("{:<30} {:<30} {:<25} CREATED", "TENANT", "REPOSITORY", "MODEL");
    for record in registry.list() {
        let model = record
            .model
            .as_ref()
            .map(|m| format!("{}:{}", m.provider, m.model))
            .unwrap_or_else(|| "default".to_string());
        println!(
            "{:<30} {:<30} {:<25} {}",
            record.tenant_id,
            record.repo_full_name,
            model,
            record.created_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

pub fn run_rotate(config: &Config, tenant_id: &str, token_env: Option<&str>) -> Result<()> {
    let token = read_token(token_env.unwrap_or(&config.publish.token_env))?;
    let mut registry = open_registry(config)?;
    registry.rotate_credentials(tenant_id, &token)?;
    println!("tenant rotate");
    println!("  tenant: {}", tenant_id);
    println!("  credentials rotated");
    Ok(())
}
