//! Launching tasks and running them in a detached process.
//!
//! A launcher (the CLI or the HTTP API) validates the request, inserts a
//! `queued` record, writes the parameter bundle to
//! `<pipeline.params_dir>/<task_id>.json`, and starts
//! `curator --config <cfg> run-task <task_id> <params_file>` without waiting
//! for it. The detached runner loads the bundle, hands it to the
//! [`TaskOrchestrator`], and removes the file however the run ends.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::config::Config;
use crate::models::{default_version_name, TaskParams};
use crate::orchestrator::{failure_message, TaskOrchestrator, TaskOutcome};
use crate::progress::StageProgressReporter;
use crate::task::TaskStore;

/// A task request as the CLI and API receive it. `version_name` is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    pub client_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub photo_types: Vec<String>,
    pub category_types: Vec<String>,
    pub channel_types: Vec<String>,
    pub dataset_id: i64,
    #[serde(default)]
    pub version_name: Option<String>,
    pub sample_per_channel: u64,
    pub username: String,
    #[serde(default)]
    pub user_email: Option<String>,
}

impl TaskRequest {
    pub fn into_params(self) -> TaskParams {
        let version_name = match self.version_name {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => default_version_name(&self.category_types),
        };
        TaskParams {
            client_id: self.client_id.trim().to_string(),
            start_date: self.start_date,
            end_date: self.end_date,
            photo_types: self.photo_types,
            category_types: self.category_types,
            channel_types: self.channel_types,
            dataset_id: self.dataset_id,
            version_name,
            sample_per_channel: self.sample_per_channel,
            username: self.username,
            user_email: self.user_email,
        }
    }
}

/// Starts the background runner for a task.
pub trait RunnerLauncher: Send + Sync {
    fn launch(&self, task_id: &str, params_file: &Path) -> Result<()>;
}

/// Re-executes the current binary as `run-task`, detached from the caller.
pub struct ProcessLauncher {
    exe: PathBuf,
    config_path: PathBuf,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, config_path: PathBuf) -> Self {
        Self { exe, config_path }
    }

    /// Launch through the running executable with an absolute config path.
    pub fn current(config_path: &Path) -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate the curator executable")?;
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("cannot resolve config path {}", config_path.display()))?;
        Ok(Self::new(exe, config_path))
    }
}

impl RunnerLauncher for ProcessLauncher {
    fn launch(&self, task_id: &str, params_file: &Path) -> Result<()> {
        let mut child = Command::new(&self.exe)
            .arg("--config")
            .arg(&self.config_path)
            .arg("run-task")
            .arg(task_id)
            .arg(params_file)
            .env("RUST_LIB_BACKTRACE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn runner for task {}", task_id))?;

        tracing::info!(task_id, pid = child.id(), "runner launched");
        // Reap the child if this process outlives it.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

/// Validate, persist, and launch a task. Returns the new task id.
pub async fn submit_task(
    config: &Config,
    store: &TaskStore,
    launcher: &dyn RunnerLauncher,
    params: TaskParams,
) -> Result<String> {
    params.validate()?;

    let task_id = uuid::Uuid::new_v4().to_string();
    store.create(&task_id, &params).await?;
    tracing::info!(task_id = %task_id, username = %params.username, "task queued");

    let params_file = write_params_file(&config.pipeline.params_dir, &task_id, &params)?;
    if let Err(e) = launcher.launch(&task_id, &params_file) {
        if let Err(rm) = std::fs::remove_file(&params_file) {
            tracing::warn!(task_id = %task_id, error = %rm, "could not remove params file");
        }
        let message = failure_message(&e);
        if store.mark_started(&task_id).await.unwrap_or(false) {
            if let Err(record) = store.mark_failed(&task_id, &message).await {
                tracing::error!(task_id = %task_id, error = %record, "could not record launch failure");
            }
        }
        return Err(e);
    }
    Ok(task_id)
}

fn write_params_file(dir: &Path, task_id: &str, params: &TaskParams) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create params dir {}", dir.display()))?;
    let path = dir.join(format!("{}.json", task_id));
    let body = serde_json::to_vec_pretty(params)?;
    std::fs::write(&path, body)
        .with_context(|| format!("cannot write params file {}", path.display()))?;
    Ok(path)
}

fn load_params(path: &Path) -> Result<TaskParams> {
    let body = std::fs::read(path)
        .with_context(|| format!("cannot read params file {}", path.display()))?;
    serde_json::from_slice(&body)
        .with_context(|| format!("malformed params file {}", path.display()))
}

/// Entry point of the detached runner (`curator run-task`).
///
/// The params file is removed on every path out of this function.
pub async fn run_task(
    config: &Config,
    task_id: &str,
    params_file: &Path,
    progress: Arc<dyn StageProgressReporter>,
) -> Result<TaskOutcome> {
    let store = TaskStore::open(config).await?;

    let prepared = load_params(params_file)
        .and_then(|params| Ok((params, TaskOrchestrator::from_config(config, store.clone())?)));
    if let Err(e) = std::fs::remove_file(params_file) {
        tracing::warn!(task_id, path = %params_file.display(), error = %e, "could not remove params file");
    }

    match prepared {
        Ok((params, orchestrator)) => Ok(orchestrator.execute(task_id, params, progress).await),
        Err(e) => Ok(fail_before_start(&store, task_id, &e).await),
    }
}

/// Record a task that could not get as far as the pipeline.
async fn fail_before_start(store: &TaskStore, task_id: &str, error: &anyhow::Error) -> TaskOutcome {
    let message = failure_message(error);
    tracing::error!(task_id, error = %format!("{:#}", error), "runner could not start task");
    match store.mark_started(task_id).await {
        Ok(true) => {
            if let Err(e) = store.mark_failed(task_id, &message).await {
                tracing::error!(task_id, error = %e, "could not record failure");
            }
        }
        Ok(false) => tracing::warn!(task_id, "task not queued; failure not recorded"),
        Err(e) => tracing::error!(task_id, error = %e, "could not mark task started"),
    }
    TaskOutcome::Failed(message)
}
