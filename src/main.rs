//! # docsync CLI
//!
//! The `docsync` binary manages the knowledge index, runs the pipeline for
//! a single change, and hosts the webhook server.
//!
//! ## Usage
//!
//! ```bash
//! docsync --config ./config/docsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsync index build` | Embed every document under the docs root |
//! | `docsync index query "<text>"` | Show the top matches and the resulting mode |
//! | `docsync index add <files...>` | Add documents without re-embedding the rest |
//! | `docsync index remove <source>` | Drop one document from the index |
//! | `docsync run ...` | Process one diff (optionally as a dry run) |
//! | `docsync serve` | Start the webhook server |
//! | `docsync seed <dir>` | Bootstrap the knowledge base from source code |
//! | `docsync tenant add\|list\|rotate` | Manage per-repository tenants |
//!
//! ## Examples
//!
//! ```bash
//! # Build the index
//! docsync index build --config ./config/docsync.toml
//!
//! # Preview what a change would produce, without publishing
//! docsync run --diff-file pr42.diff --title "Add profile endpoint" \
//!     --change-id 42 --repo acme/widgets --dry-run
//!
//! # Serve webhooks with JSON progress on stderr
//! docsync serve --progress json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

use docsync::config;
use docsync::progress::{spawn_sink, ProgressMode, ProgressReporter, TenantLogProgress};
use docsync::{index_cmd, pipeline, run_cmd, seed, server, tenant_cmd};

/// docsync keeps a knowledge base in sync with merged code changes.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docsync",
    about = "Keeps a living knowledge base in sync with merged code changes",
    version,
    long_about = "docsync classifies merged changes, finds the documentation they affect, \
    rewrites or extends it with a language model, and opens a pull request with the result."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docsync.toml")]
    config: PathBuf,

    /// Progress output on stderr: off, human, or json.
    ///
    /// Defaults to human when stderr is a terminal, otherwise off.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Build, query or extend the knowledge index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Run the pipeline for one change.
    ///
    /// Classifies the diff, retrieves related docs, generates the update,
    /// appends it to the ledger and opens a pull request. With `--dry-run`
    /// nothing is written anywhere.
    Run {
        /// File holding the unified diff.
        #[arg(long)]
        diff_file: PathBuf,

        /// Title of the change (pull request title or commit subject).
        #[arg(long)]
        title: String,

        /// Stable change id (pull request number or short sha).
        #[arg(long)]
        change_id: String,

        /// Repository as `owner/name`.
        #[arg(long)]
        repo: String,

        #[arg(long, default_value = "unknown")]
        author: String,

        /// Stop before writing; print the decision and generated text.
        #[arg(long)]
        dry_run: bool,
    },

    /// Start the webhook server on `[server].bind`.
    Serve,

    /// Generate an initial overview from source code and index it.
    Seed {
        /// Project source directory.
        dir: PathBuf,
    },

    /// Manage tenants (one per onboarded repository).
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild the index from the docs root.
    Build,

    /// Query the index.
    Query {
        text: String,

        /// Number of results (defaults to `retrieval.top_k`).
        #[arg(long)]
        k: Option<usize>,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Add files to the index.
    Add {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Remove every chunk of one source path.
    Remove { source: String },
}

#[derive(Subcommand)]
enum TenantAction {
    /// Register a repository.
    Add {
        /// Repository as `owner/name`.
        repo: String,

        /// Environment variable holding the access token
        /// (defaults to `publish.token_env`).
        #[arg(long)]
        token_env: Option<String>,

        /// Language model provider for this tenant.
        #[arg(long)]
        llm_provider: Option<String>,

        /// Language model for this tenant.
        #[arg(long)]
        llm_model: Option<String>,
    },

    /// List registered tenants.
    List,

    /// Replace a tenant's access token.
    Rotate {
        tenant_id: String,

        #[arg(long)]
        token_env: Option<String>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docsync=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_mode(flag: Option<&str>) -> anyhow::Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some(s) => ProgressMode::parse(s)
            .ok_or_else(|| anyhow::anyhow!("--progress must be off, human or json (got '{}')", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mode = progress_mode(cli.progress.as_deref())?;
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Index { action } => match action {
            IndexAction::Build => index_cmd::run_build(&cfg).await?,
            IndexAction::Query { text, k, json } => {
                index_cmd::run_query(&cfg, &text, k, json).await?
            }
            IndexAction::Add { files } => index_cmd::run_add(&cfg, &files).await?,
            IndexAction::Remove { source } => index_cmd::run_remove(&cfg, &source).await?,
        },
        Commands::Run {
            diff_file,
            title,
            change_id,
            repo,
            author,
            dry_run,
        } => {
            let mut reporters: Vec<Box<dyn ProgressReporter>> = Vec::new();
            if let Some(reporter) = mode.reporter() {
                reporters.push(reporter);
            }
            if let Some(dir) = &cfg.progress.log_dir {
                reporters.push(Box::new(TenantLogProgress::new(dir)));
            }
            let (progress, sink) = spawn_sink(cfg.progress.channel_capacity, reporters);

            let args = run_cmd::RunArgs {
                diff_file,
                title,
                change_id,
                repo,
                author,
                dry_run,
            };
            let result = run_cmd::run_change(&cfg, args, &progress).await;

            // Flush progress before reporting the result.
            drop(progress);
            let _ = sink.await;
            result?;
        }
        Commands::Serve => {
            server::run_server(&cfg, mode).await?;
        }
        Commands::Seed { dir } => {
            let services = pipeline::Services::initialize(&cfg).await?;
            let report = seed::run_seed(&services, &dir).await?;
            println!("seed");
            println!("  files read: {}", report.files_read);
            println!("  truncated: {}", report.truncated);
            println!("  chunks indexed: {}", report.chunks_indexed);
        }
        Commands::Tenant { action } => match action {
            TenantAction::Add {
                repo,
                token_env,
                llm_provider,
                llm_model,
            } => tenant_cmd::run_add(&cfg, &repo, token_env.as_deref(), llm_provider, llm_model)?,
            TenantAction::List => tenant_cmd::run_list(&cfg)?,
            TenantAction::Rotate {
                tenant_id,
                token_env,
            } => tenant_cmd::run_rotate(&cfg, &tenant_id, token_env.as_deref())?,
        },
    }

    Ok(())
}
