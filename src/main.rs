//! # Session Curator CLI (`curator`)
//!
//! The `curator` binary launches and tracks curation tasks, previews
//! candidate sessions, administers curation datasets, and serves the JSON
//! HTTP API. It is also the detached background runner (`run-task`).
//!
//! ## Usage
//!
//! ```bash
//! curator --config ./config/curator.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `curator init` | Create the SQLite database and the task table |
//! | `curator task create …` | Queue a task and launch its runner |
//! | `curator task list` | List tasks, newest first |
//! | `curator task show <id>` | Show one task with its summary or error |
//! | `curator task cancel <id>` | Cancel a started task |
//! | `curator run-task <id> <params_file>` | Background runner entry point |
//! | `curator summary` | Task counts by status |
//! | `curator preview …` | Candidate statistics and sample size, no writes |
//! | `curator metadata <client_id>` | Available filter names |
//! | `curator dataset create\|update\|labels` | Curation administration |
//! | `curator serve` | Start the JSON HTTP API |

use clap::{Args, Parser, Subcommand};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;

use session_curator::config;
use session_curator::curation::{DatasetSpec, TierFlags};
use session_curator::dataset_cmd::{self, LabelArgs};
use session_curator::logging;
use session_curator::migrate;
use session_curator::models::split_names;
use session_curator::orchestrator::TaskOutcome;
use session_curator::progress::ProgressMode;
use session_curator::runner::{self, ProcessLauncher, TaskRequest};
use session_curator::server;
use session_curator::session_source::SessionQuery;
use session_curator::stats;
use session_curator::tasks_cmd;

/// Session Curator: sample shelf-image sessions into a curation platform.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/curator.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "curator",
    about = "Session Curator: sample shelf-image sessions into a curation platform",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/curator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the `tasks` table. Idempotent.
    Init,

    /// Create, list, inspect and cancel tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Run one task to completion (started by `task create` and the API).
    RunTask {
        task_id: String,
        /// JSON parameter bundle written by the launcher; removed afterwards.
        params_file: PathBuf,
        /// Progress on stderr. Defaults to human on a TTY, off otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Task counts by status.
    Summary {
        #[arg(long)]
        user: Option<String>,
    },

    /// Collect candidates and size the sample without creating a task.
    Preview {
        #[command(flatten)]
        filters: FilterArgs,
        /// Image budget per group.
        #[arg(long)]
        budget: u64,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List the photo types, categories and channels available to a client.
    Metadata { client_id: String },

    /// Curation platform administration.
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },

    /// Start the JSON HTTP API on `[server].bind`.
    Serve,
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    client: String,
    /// First day of the range (YYYY-MM-DD).
    #[arg(long)]
    from: NaiveDate,
    /// Last day of the range (YYYY-MM-DD).
    #[arg(long)]
    to: NaiveDate,
    /// Comma-separated category names.
    #[arg(long)]
    categories: String,
    /// Comma-separated photo type names.
    #[arg(long)]
    photo_types: String,
    /// Comma-separated channel names.
    #[arg(long)]
    channels: String,
}

impl FilterArgs {
    fn query(&self) -> SessionQuery {
        SessionQuery {
            client_id: self.client.trim().to_string(),
            start_date: self.from,
            end_date: self.to,
            categories: split_names(&self.categories),
            photo_types: split_names(&self.photo_types),
            channels: split_names(&self.channels),
        }
    }
}

#[derive(Subcommand)]
enum TaskAction {
    /// Queue a task and launch its background runner. Prints the task id.
    Create {
        /// Requester identity.
        #[arg(long)]
        user: String,
        #[arg(long)]
        email: Option<String>,
        #[command(flatten)]
        filters: FilterArgs,
        /// Curation dataset id.
        #[arg(long)]
        dataset: i64,
        /// Dataset version name. Defaults to `<categories>_<timestamp>`.
        #[arg(long)]
        version: Option<String>,
        /// Image budget per group.
        #[arg(long)]
        budget: u64,
    },
    /// List tasks, newest first.
    List {
        #[arg(long)]
        user: Option<String>,
    },
    /// Show one task.
    Show { id: String },
    /// Cancel a started task.
    Cancel { id: String },
}

#[derive(Args)]
struct TierArgs {
    /// Detection tier flags. `true`/`false` become booleans; other text is sent as-is.
    #[arg(long, default_value = "false")]
    det_category: String,
    #[arg(long, default_value = "false")]
    det_brand: String,
    #[arg(long, default_value = "false")]
    det_brandform: String,
    #[arg(long, default_value = "false")]
    det_variant: String,
    #[arg(long, default_value = "false")]
    det_sku: String,
    /// Classification tier flags.
    #[arg(long, default_value = "false")]
    cls_category: String,
    #[arg(long, default_value = "false")]
    cls_brand: String,
    #[arg(long, default_value = "false")]
    cls_brandform: String,
    #[arg(long, default_value = "false")]
    cls_variant: String,
    #[arg(long, default_value = "false")]
    cls_sku: String,
    /// Enable the text tier.
    #[arg(long)]
    text: bool,
}

impl TierArgs {
    fn spec(self, title: String, curation_type: String, version_title: String) -> DatasetSpec {
        DatasetSpec {
            title,
            curation_type,
            version_title,
            detection: TierFlags::from_raw([
                self.det_category.as_str(),
                self.det_brand.as_str(),
                self.det_brandform.as_str(),
                self.det_variant.as_str(),
                self.det_sku.as_str(),
            ]),
            classification: TierFlags::from_raw([
                self.cls_category.as_str(),
                self.cls_brand.as_str(),
                self.cls_brandform.as_str(),
                self.cls_variant.as_str(),
                self.cls_sku.as_str(),
            ]),
            text: self.text,
        }
    }
}

#[derive(Subcommand)]
enum DatasetAction {
    /// Create a dataset.
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "bounding-box")]
        curation_type: String,
        #[arg(long)]
        version: String,
        #[command(flatten)]
        tiers: TierArgs,
    },
    /// Update an existing dataset; its title is looked up by id.
    Update {
        #[arg(long)]
        id: i64,
        #[arg(long, default_value = "bounding-box")]
        curation_type: String,
        #[arg(long)]
        version: String,
        #[command(flatten)]
        tiers: TierArgs,
    },
    /// Bulk-add labels from one sheet of an `.xlsx` workbook.
    Labels {
        #[arg(long)]
        dataset: i64,
        /// category, brand, brandform, variant, sku or text.
        #[arg(long)]
        level: String,
        #[arg(long)]
        workbook: PathBuf,
        #[arg(long)]
        sheet: String,
        /// Header of the column holding internal names.
        #[arg(long)]
        internal_column: String,
        /// Header of the column holding display titles.
        #[arg(long)]
        mapping_column: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let component = match &cli.command {
        Commands::RunTask { .. } => "runner",
        Commands::Serve => "server",
        _ => "cli",
    };
    logging::init_logging(&cfg.logging, component)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Task { action } => match action {
            TaskAction::Create {
                user,
                email,
                filters,
                dataset,
                version,
                budget,
            } => {
                let query = filters.query();
                let request = TaskRequest {
                    client_id: query.client_id,
                    start_date: query.start_date,
                    end_date: query.end_date,
                    photo_types: query.photo_types,
                    category_types: query.categories,
                    channel_types: query.channels,
                    dataset_id: dataset,
                    version_name: version,
                    sample_per_channel: budget,
                    username: user,
                    user_email: email,
                };
                let launcher = ProcessLauncher::current(&cli.config)?;
                tasks_cmd::run_task_create(&cfg, &launcher, request).await?;
            }
            TaskAction::List { user } => {
                tasks_cmd::run_task_list(&cfg, user.as_deref()).await?;
            }
            TaskAction::Show { id } => {
                tasks_cmd::run_task_show(&cfg, &id).await?;
            }
            TaskAction::Cancel { id } => {
                tasks_cmd::run_task_cancel(&cfg, &id).await?;
            }
        },
        Commands::RunTask {
            task_id,
            params_file,
            progress,
        } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let outcome =
                runner::run_task(&cfg, &task_id, &params_file, Arc::from(mode.reporter())).await?;
            match outcome {
                TaskOutcome::Completed(summary) => {
                    println!("{}", serde_json::to_string_pretty(&summary)?)
                }
                TaskOutcome::Failed(message) => eprintln!("Task failed: {}", message),
                TaskOutcome::Cancelled => eprintln!("Task cancelled."),
            }
        }
        Commands::Summary { user } => {
            stats::run_summary(&cfg, user.as_deref()).await?;
        }
        Commands::Preview {
            filters,
            budget,
            json,
        } => {
            stats::run_preview(&cfg, &filters.query(), budget, json).await?;
        }
        Commands::Metadata { client_id } => {
            stats::run_metadata(&cfg, &client_id).await?;
        }
        Commands::Dataset { action } => match action {
            DatasetAction::Create {
                title,
                curation_type,
                version,
                tiers,
            } => {
                let spec = tiers.spec(title, curation_type, version);
                dataset_cmd::run_dataset_create(&cfg, spec).await?;
            }
            DatasetAction::Update {
                id,
                curation_type,
                version,
                tiers,
            } => {
                // The title is replaced by the resolved name before sending.
                let spec = tiers.spec(String::new(), curation_type, version);
                dataset_cmd::run_dataset_update(&cfg, id, spec).await?;
            }
            DatasetAction::Labels {
                dataset,
                level,
                workbook,
                sheet,
                internal_column,
                mapping_column,
            } => {
                dataset_cmd::run_dataset_labels(
                    &cfg,
                    LabelArgs {
                        dataset_id: dataset,
                        level: &level,
                        workbook: &workbook,
                        sheet: &sheet,
                        internal_column: &internal_column,
                        mapping_column: &mapping_column,
                    },
                )
                .await?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg, &cli.config).await?;
        }
    }

    Ok(())
}
