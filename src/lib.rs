//! # Session Curator
//!
//! Pulls retail shelf-image sessions from an analytics provider, downloads
//! the AI-processed output for a sampled subset, and uploads those outputs
//! into a curation platform. Each run is a long-lived background task with
//! a durable status record and cooperative cancellation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  POST /tasks   ┌────────────┐  spawn   ┌──────────────────┐
//! │  CLI/API  │───────────────▶│  SQLite    │◀────────▶│ curator run-task │
//! │ (curator) │  task cancel   │  tasks     │  status  │  (orchestrator)  │
//! └───────────┘                └────────────┘          └────────┬─────────┘
//!                                                               │
//!            ┌──────────────────────┬───────────────────────────┤
//!            ▼                      ▼                           ▼
//!     ┌─────────────┐       ┌───────────────┐           ┌──────────────┐
//!     │  analytics  │       │ AI controller │           │   curation   │
//!     │  (sessions) │       │   (outputs)   │           │   (upload)   │
//!     └─────────────┘       └───────────────┘           └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! curator init
//! curator preview --client acme --from 2025-08-01 --to 2025-10-31 \
//!     --categories chips --photo-types shelf --channels mt --budget 800
//! curator task create --user ops --client acme --from 2025-08-01 --to 2025-10-31 \
//!     --categories chips --photo-types shelf --channels mt --dataset 384 --budget 800
//! curator task show <task_id>
//! curator serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Sessions, documents, task parameters, result summary |
//! | [`task`] | Task status machine and the durable task store |
//! | [`session_source`] | Analytics client and candidate collection |
//! | [`sampler`] | Dedup and store-diverse sampling |
//! | [`output_fetcher`] | Two-hop processed-output download |
//! | [`curation`] | Curation client, bulk upload, dataset administration |
//! | [`schema_sheet`] | `.xlsx` label schema reader |
//! | [`orchestrator`] | The three-stage pipeline |
//! | [`runner`] | Task launch and the detached runner entry point |
//! | [`server`] | JSON HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cancel;
pub mod config;
pub mod curation;
pub mod dataset_cmd;
pub mod db;
pub mod error;
pub mod http;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod output_fetcher;
pub mod progress;
pub mod runner;
pub mod sampler;
pub mod schema_sheet;
pub mod server;
pub mod session_source;
pub mod stats;
pub mod task;
pub mod tasks_cmd;
