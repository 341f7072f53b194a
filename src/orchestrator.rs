//! Drives one task through fetch → sample → download → upload.
//!
//! The orchestrator owns every status write a running task makes. It marks
//! the task `started`, runs the stages on a spawned tokio task so a panic
//! inside them surfaces as a [`tokio::task::JoinError`] instead of tearing
//! down the runner, and records exactly one terminal outcome.
//!
//! Cancellation is observed, never written here: the probe is consulted
//! before stage 1, after stage 1, after sampling, after stage 2 and every
//! `check_every` items inside stages 2 and 3. Once a cancellation is seen
//! the run returns immediately and no summary is stored.

use anyhow::Result;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once, OnceLock};

use crate::cancel::{CancellationProbe, StageContext, StageResult, StoreProbe};
use crate::config::Config;
use crate::curation::{upload_documents, CurationClient, CurationUploader};
use crate::models::{ResultSummary, TaskParams, UploadTarget};
use crate::output_fetcher::{fetch_outputs, AiControllerClient, OutputFetcher};
use crate::progress::{Stage, StageProgressEvent, StageProgressReporter};
use crate::sampler::{dedup_sessions, sample_sessions, GroupBy};
use crate::session_source::{collect_candidates, flatten, AnalyticsClient, SessionQuery, SessionSource};
use crate::task::{TaskStatus, TaskStore};

/// Tuning that applies to every task a runner executes.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub check_every: usize,
    pub group_by: GroupBy,
    pub softtags: Vec<String>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            check_every: config.pipeline.cancel_check_interval,
            group_by: config.pipeline.group_by,
            softtags: config.curation.softtags.clone(),
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(ResultSummary),
    Failed(String),
    Cancelled,
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    sessions: Arc<dyn SessionSource>,
    outputs: Arc<dyn OutputFetcher>,
    curation: Arc<dyn CurationUploader>,
    store: TaskStore,
    settings: PipelineSettings,
}

impl TaskOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionSource>,
        outputs: Arc<dyn OutputFetcher>,
        curation: Arc<dyn CurationUploader>,
        store: TaskStore,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            sessions,
            outputs,
            curation,
            store,
            settings,
        }
    }

    /// Wire the HTTP clients for the three upstream services.
    pub fn from_config(config: &Config, store: TaskStore) -> Result<Self> {
        Ok(Self::new(
            Arc::new(AnalyticsClient::from_config(config)?),
            Arc::new(AiControllerClient::from_config(config)?),
            Arc::new(CurationClient::from_config(config)?),
            store,
            PipelineSettings::from_config(config),
        ))
    }

    /// Run a queued task to its terminal state.
    ///
    /// Never returns an error: every failure, including a panic in a stage,
    /// is recorded on the task and reported as [`TaskOutcome::Failed`].
    pub async fn execute(
        &self,
        task_id: &str,
        params: TaskParams,
        progress: Arc<dyn StageProgressReporter>,
    ) -> TaskOutcome {
        match self.store.mark_started(task_id).await {
            Ok(true) => tracing::info!(task_id, "task started"),
            Ok(false) => {
                return match self.store.status(task_id).await {
                    Ok(Some(TaskStatus::Cancelled)) => TaskOutcome::Cancelled,
                    Ok(Some(status)) => {
                        tracing::warn!(task_id, %status, "task is not queued; not running it");
                        TaskOutcome::Failed(format!("task was {} when the runner started", status))
                    }
                    Ok(None) => TaskOutcome::Failed(format!("task {} does not exist", task_id)),
                    Err(e) => TaskOutcome::Failed(format!("{:#}", e)),
                };
            }
            Err(e) => {
                tracing::error!(task_id, error = %e, "could not mark task started");
                return TaskOutcome::Failed(format!("{:#}", e));
            }
        }

        install_panic_hook();
        let this = self.clone();
        let id = task_id.to_string();
        let joined = tokio::spawn(PANICKING_TASK.scope(id.clone(), async move {
            this.run_stages(&id, &params, progress.as_ref()).await
        }))
        .await;

        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => TaskOutcome::Failed(failure_message(&e)),
            Err(join_error) if join_error.is_panic() => {
                let payload = join_error.into_panic();
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic payload".to_string()
                };
                let mut message = format!("pipeline panicked: {}", msg);
                if let Some(report) = take_panic_report(task_id) {
                    message.push_str(&format!(
                        "\n\nat {}\n\nbacktrace:\n{}",
                        report.location, report.backtrace
                    ));
                }
                TaskOutcome::Failed(message)
            }
            Err(join_error) => TaskOutcome::Failed(format!("pipeline aborted: {}", join_error)),
        };

        self.record(task_id, outcome).await
    }

    /// Persist a terminal outcome. A write that lands on an already-terminal
    /// task is dropped, and the persisted status wins.
    async fn record(&self, task_id: &str, outcome: TaskOutcome) -> TaskOutcome {
        let written = match &outcome {
            TaskOutcome::Completed(summary) => self.store.mark_completed(task_id, summary).await,
            TaskOutcome::Failed(msg) => {
                tracing::error!(task_id, error = %msg, "task failed");
                self.store.mark_failed(task_id, msg).await
            }
            TaskOutcome::Cancelled => {
                tracing::info!(task_id, "task cancelled");
                return outcome;
            }
        };

        match written {
            Ok(true) => {
                if let TaskOutcome::Completed(summary) = &outcome {
                    tracing::info!(
                        task_id,
                        uploaded = summary.uploaded,
                        failed_uploads = summary.failed_uploads,
                        "task completed"
                    );
                }
                outcome
            }
            Ok(false) => {
                tracing::warn!(task_id, "terminal status already set; outcome not written");
                if self.store.is_cancelled(task_id).await {
                    TaskOutcome::Cancelled
                } else {
                    outcome
                }
            }
            Err(e) => {
                tracing::error!(task_id, error = %e, "could not record task outcome");
                outcome
            }
        }
    }

    async fn run_stages(
        &self,
        task_id: &str,
        params: &TaskParams,
        progress: &dyn StageProgressReporter,
    ) -> Result<TaskOutcome> {
        let probe = StoreProbe::new(self.store.clone(), task_id);
        let ctx = StageContext {
            probe: &probe,
            check_every: self.settings.check_every,
            progress,
        };

        if probe.is_cancelled().await {
            return Ok(TaskOutcome::Cancelled);
        }

        let dataset_name = self.curation.resolve_dataset_name(params.dataset_id).await?;
        tracing::info!(task_id, dataset_id = params.dataset_id, dataset = %dataset_name, "dataset resolved");

        // Stage 1: candidates
        progress.report(StageProgressEvent::Started {
            stage: Stage::FetchSessions,
            total: None,
        });
        let query = SessionQuery::from_params(params);
        let raw = flatten(collect_candidates(self.sessions.as_ref(), &query).await);
        let raw_count = raw.len();
        let candidates = dedup_sessions(raw);
        progress.report(StageProgressEvent::Finished {
            stage: Stage::FetchSessions,
            count: candidates.len() as u64,
        });
        tracing::info!(task_id, raw = raw_count, unique = candidates.len(), "candidates collected");

        if candidates.is_empty() {
            return Ok(TaskOutcome::Failed(format!(
                "no sessions found for client {} between {} and {} (categories: {}; photo types: {}; channels: {})",
                params.client_id,
                params.start_date,
                params.end_date,
                params.category_types.join(","),
                params.photo_types.join(","),
                params.channel_types.join(","),
            )));
        }
        if probe.is_cancelled().await {
            return Ok(TaskOutcome::Cancelled);
        }

        progress.report(StageProgressEvent::Started {
            stage: Stage::Sample,
            total: Some(candidates.len() as u64),
        });
        let sampled = sample_sessions(&candidates, params.sample_per_channel, self.settings.group_by);
        progress.report(StageProgressEvent::Finished {
            stage: Stage::Sample,
            count: sampled.len() as u64,
        });
        tracing::info!(task_id, sampled = sampled.len(), budget = params.sample_per_channel, "sessions sampled");

        if probe.is_cancelled().await {
            return Ok(TaskOutcome::Cancelled);
        }

        // Stage 2: processed outputs
        let session_ids: Vec<String> = sampled.iter().map(|s| s.session_id.clone()).collect();
        let fetched = match fetch_outputs(self.outputs.as_ref(), &params.client_id, &session_ids, &ctx).await {
            StageResult::Done(report) => report,
            StageResult::Cancelled => return Ok(TaskOutcome::Cancelled),
        };
        tracing::info!(
            task_id,
            downloaded = fetched.documents.len(),
            failed = fetched.failed_ids.len(),
            "outputs downloaded"
        );

        if fetched.documents.is_empty() {
            return Ok(TaskOutcome::Failed(format!(
                "no processed outputs could be downloaded for the {} sampled sessions",
                sampled.len()
            )));
        }
        if probe.is_cancelled().await {
            return Ok(TaskOutcome::Cancelled);
        }

        // Stage 3: upload
        let target = UploadTarget {
            dataset_id: params.dataset_id,
            dataset_name,
            version_name: params.version_name.clone(),
            softtags: self.settings.softtags.clone(),
        };
        let uploaded = match upload_documents(self.curation.as_ref(), &target, &fetched.documents, &ctx).await {
            StageResult::Done(report) => report,
            StageResult::Cancelled => return Ok(TaskOutcome::Cancelled),
        };

        Ok(TaskOutcome::Completed(ResultSummary {
            total_candidates: candidates.len(),
            sampled_sessions: sampled.len(),
            downloaded_documents: fetched.documents.len(),
            failed_downloads: fetched.failed_ids.len(),
            uploaded: uploaded.uploaded,
            failed_uploads: uploaded.failed_ids.len(),
            failed_upload_ids: uploaded.failed_ids,
            dataset_id: target.dataset_id,
            dataset_name: target.dataset_name,
            version_name: target.version_name,
        }))
    }
}

/// Error text with its cause chain and a backtrace.
///
/// The error's own backtrace is used when one was captured at its origin;
/// otherwise the trace of the point where the failure is recorded is
/// forced.
pub(crate) fn failure_message(error: &anyhow::Error) -> String {
    let backtrace = error.backtrace();
    if backtrace.status() == BacktraceStatus::Captured {
        format!("{:#}\n\nbacktrace:\n{}", error, backtrace)
    } else {
        format!(
            "{:#}\n\nbacktrace (where the failure was recorded):\n{}",
            error,
            Backtrace::force_capture()
        )
    }
}

// ============ Panic capture ============

tokio::task_local! {
    /// Task id of the stage body running on this tokio task.
    static PANICKING_TASK: String;
}

struct PanicReport {
    location: String,
    backtrace: Backtrace,
}

fn panic_reports() -> &'static Mutex<HashMap<String, PanicReport>> {
    static REPORTS: OnceLock<Mutex<HashMap<String, PanicReport>>> = OnceLock::new();
    REPORTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Chain a hook that records where a stage body panicked and its backtrace.
/// Panics outside a stage body only reach the previous hook.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = PANICKING_TASK.try_with(|task_id| {
                let location = info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                    .unwrap_or_else(|| "unknown location".to_string());
                if let Ok(mut reports) = panic_reports().lock() {
                    reports.insert(
                        task_id.clone(),
                        PanicReport {
                            location,
                            backtrace: Backtrace::force_capture(),
                        },
                    );
                }
            });
            previous(info);
        }));
    });
}

fn take_panic_report(task_id: &str) -> Option<PanicReport> {
    panic_reports().lock().ok()?.remove(task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn failure_message_includes_cause_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("connection reset"))
            .context("dataset listing")
            .unwrap_err();
        let msg = failure_message(&err);
        assert!(msg.starts_with("dataset listing: connection reset"));
        assert!(msg.contains("backtrace"));
    }

    #[tokio::test]
    async fn panic_hook_records_location_for_the_scoped_task() {
        install_panic_hook();
        let joined = tokio::spawn(PANICKING_TASK.scope("t-hook".to_string(), async {
            panic!("bad payload");
        }))
        .await;
        assert!(joined.unwrap_err().is_panic());

        let report = take_panic_report("t-hook").unwrap();
        assert!(report.location.contains("orchestrator.rs"));
        assert!(take_panic_report("t-hook").is_none());
    }
}
