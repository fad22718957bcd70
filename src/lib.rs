//! # docsync
//!
//! Keeps a living knowledge base in sync with merged code changes.
//!
//! Every merged pull request or push is classified; functional changes are
//! matched against an embedded knowledge base, and the best-matching pages
//! are revised (or a new ledger section is written when nothing matches
//! well enough). The result is published back to the repository as a pull
//! request and folded into the index so the next run can find it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────┐   ┌──────────┐
//! │ Webhook  │──▶│ Classifier │──▶│ Retriever │──▶│  Mode    │
//! │ / CLI    │   │   (LLM)    │   │ (SQLite)  │   │ selector │
//! └──────────┘   └────────────┘   └───────────┘   └────┬─────┘
//!                                                      ▼
//!      ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!      │  GitHub  │◀──│ Publish  │◀──│  Ledger  │◀──│Generator │
//!      │    PR    │   │ pipeline │   │ + index  │   │  (LLM)   │
//!      └──────────┘   └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docsync index build                       # embed the docs root
//! docsync index query "profile endpoint"    # inspect retrieval
//! docsync run --diff-file change.diff --title "Add profile" \
//!     --change-id 42 --repo acme/widgets --dry-run
//! docsync serve                             # webhook server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Types handed between stages |
//! | [`error`] | Stage error taxonomy |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Language model adapters |
//! | [`index`] | Persistent vector index |
//! | [`classifier`] | Functional-change classification |
//! | [`retriever`] | Relevance retrieval |
//! | [`mode`] | Create-versus-update decision |
//! | [`generator`] | Documentation text generation |
//! | [`ledger`] | Append-only local ledger |
//! | [`host`] | Repository host (GitHub REST, in-memory) |
//! | [`publish`] | Branch, file and pull request workflow |
//! | [`pipeline`] | End-to-end run orchestration |
//! | [`progress`] | User-facing progress events |
//! | [`ingress`] | Webhook event parsing and signatures |
//! | [`diff_source`] | Diff resolution |
//! | [`tenants`] | Per-repository credentials and models |
//! | [`server`] | Webhook HTTP server |
//! | [`docs_loader`] | Knowledge base loading |
//! | [`seed`] | Bootstrapping from source code |

pub mod chunk;
pub mod classifier;
pub mod config;
pub mod diff_source;
pub mod docs_loader;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod host;
pub mod http;
pub mod index;
pub mod index_cmd;
pub mod ingress;
pub mod ledger;
pub mod llm;
pub mod mode;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod publish;
pub mod retriever;
pub mod run_cmd;
pub mod seed;
pub mod server;
pub mod tenant_cmd;
pub mod tenants;
