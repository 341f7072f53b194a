//! Task records and the durable task store.
//!
//! The store is the single source of truth for task state. The detached
//! runner, the CLI and the HTTP API are separate processes that only meet
//! here, which is also how cancellation travels: the API flips the status,
//! the runner polls it.
//!
//! # Status machine
//!
//! ```text
//! queued ──▶ started ──┬──▶ completed
//!                      ├──▶ failed
//!                      └──▶ cancelled
//! ```
//!
//! Every status write is a conditional update guarded by the set of states
//! the target is reachable from, so a cancellation that lands first can
//! never be overwritten by the runner's own `completed` or `failed` write.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::str::FromStr;

use crate::config::Config;
use crate::db;
use crate::error::CuratorError;
use crate::migrate;
use crate::models::{ResultSummary, TaskParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Started,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Started => "started",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Started) | (Started, Completed) | (Started, Failed) | (Started, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// States from which `to` may be entered.
    pub fn sources_of(to: TaskStatus) -> Vec<TaskStatus> {
        TaskStatus::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CuratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CuratorError::UnknownStatus(s.to_string()))
    }
}

/// A persisted task, as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(flatten)]
    pub params: TaskParams,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_summary: Option<serde_json::Value>,
}

/// Task counts by status, for the summary view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: i64,
    pub queued: i64,
    pub started: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    pub fn in_progress(&self) -> i64 {
        self.queued + self.started
    }
}

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a new task in `queued` state.
    pub async fn create(&self, task_id: &str, params: &TaskParams) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, username, user_email, client_id, start_date, end_date,
                photo_types, category_types, channel_types, dataset_id, version_name,
                sample_per_channel, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task_id)
        .bind(&params.username)
        .bind(&params.user_email)
        .bind(&params.client_id)
        .bind(params.start_date.to_string())
        .bind(params.end_date.to_string())
        .bind(serde_json::to_string(&params.photo_types)?)
        .bind(serde_json::to_string(&params.category_types)?)
        .bind(serde_json::to_string(&params.channel_types)?)
        .bind(params.dataset_id)
        .bind(&params.version_name)
        .bind(params.sample_per_channel as i64)
        .bind(TaskStatus::Queued.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert task {}", task_id))?;

        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    pub async fn status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status.map(|s| s.parse::<TaskStatus>()).transpose()?)
    }

    /// List tasks newest first, optionally restricted to one requester.
    pub async fn list(&self, username: Option<&str>) -> Result<Vec<TaskRecord>> {
        let rows = match username {
            Some(user) => {
                sqlx::query("SELECT * FROM tasks WHERE username = ? ORDER BY created_at DESC, rowid DESC")
                    .bind(user)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC, rowid DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(record_from_row).collect()
    }

    pub async fn mark_started(&self, task_id: &str) -> Result<bool> {
        self.transition(task_id, TaskStatus::Started, None, None).await
    }

    pub async fn mark_completed(&self, task_id: &str, summary: &ResultSummary) -> Result<bool> {
        let summary_json = serde_json::to_string(summary)?;
        self.transition(task_id, TaskStatus::Completed, None, Some(&summary_json))
            .await
    }

    pub async fn mark_failed(&self, task_id: &str, error_message: &str) -> Result<bool> {
        self.transition(task_id, TaskStatus::Failed, Some(error_message), None)
            .await
    }

    /// Request cancellation of a running task.
    ///
    /// Only a `started` task can be cancelled; anything else is reported as
    /// an illegal transition so the caller sees why nothing happened.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        if self
            .transition(task_id, TaskStatus::Cancelled, None, None)
            .await?
        {
            tracing::info!(task_id, "cancellation recorded");
            return Ok(());
        }

        match self.status(task_id).await? {
            None => Err(CuratorError::TaskNotFound(task_id.to_string()).into()),
            Some(current) => Err(CuratorError::IllegalTransition {
                task_id: task_id.to_string(),
                from: current.to_string(),
                to: TaskStatus::Cancelled.to_string(),
            }
            .into()),
        }
    }

    /// Whether the persisted status is `cancelled`.
    ///
    /// A failed read is treated as "not cancelled" so a flaky store cannot
    /// abort a healthy run.
    pub async fn is_cancelled(&self, task_id: &str) -> bool {
        match self.status(task_id).await {
            Ok(status) => status == Some(TaskStatus::Cancelled),
            Err(e) => {
                tracing::error!(task_id, error = %e, "error checking cancellation");
                false
            }
        }
    }

    pub async fn status_counts(&self, username: Option<&str>) -> Result<StatusCounts> {
        let rows = match username {
            Some(user) => {
                sqlx::query("SELECT status, COUNT(*) AS n FROM tasks WHERE username = ? GROUP BY status")
                    .bind(user)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            counts.total += n;
            match status.parse::<TaskStatus>()? {
                TaskStatus::Queued => counts.queued += n,
                TaskStatus::Started => counts.started += n,
                TaskStatus::Completed => counts.completed += n,
                TaskStatus::Failed => counts.failed += n,
                TaskStatus::Cancelled => counts.cancelled += n,
            }
        }
        Ok(counts)
    }

    /// Conditionally move a task to `to`.
    ///
    /// Returns `false` when the task was not in a state `to` is reachable
    /// from (including when it does not exist); the row is left untouched.
    async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        error_message: Option<&str>,
        result_summary: Option<&str>,
    ) -> Result<bool> {
        let sources = TaskStatus::sources_of(to);
        let placeholders = vec!["?"; sources.len()].join(", ");
        let timestamp_column = if to == TaskStatus::Started {
            "started_at"
        } else {
            "completed_at"
        };
        let sql = format!(
            "UPDATE tasks SET status = ?, {} = ?, \
             error_message = COALESCE(?, error_message), \
             result_summary = COALESCE(?, result_summary) \
             WHERE task_id = ? AND status IN ({})",
            timestamp_column, placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now().timestamp())
            .bind(error_message)
            .bind(result_summary)
            .bind(task_id);
        for source in &sources {
            query = query.bind(source.as_str());
        }

        let result = query.execute(&self.pool).await?;
        let applied = result.rows_affected() == 1;
        if applied {
            tracing::info!(task_id, status = %to, "task status updated");
        } else {
            tracing::warn!(task_id, status = %to, "status update skipped: task not in a source state");
        }
        Ok(applied)
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord> {
    let status: String = row.get("status");
    let summary: Option<String> = row.get("result_summary");
    let start_date: String = row.get("start_date");
    let end_date: String = row.get("end_date");
    let sample_per_channel: i64 = row.get("sample_per_channel");

    let params = TaskParams {
        client_id: row.get("client_id"),
        start_date: NaiveDate::parse_from_str(&start_date, "%Y-%m-%d")?,
        end_date: NaiveDate::parse_from_str(&end_date, "%Y-%m-%d")?,
        photo_types: json_list(row, "photo_types")?,
        category_types: json_list(row, "category_types")?,
        channel_types: json_list(row, "channel_types")?,
        dataset_id: row.get("dataset_id"),
        version_name: row.get("version_name"),
        sample_per_channel: sample_per_channel.max(0) as u64,
        username: row.get("username"),
        user_email: row.get("user_email"),
    };

    Ok(TaskRecord {
        task_id: row.get("task_id"),
        params,
        status: status.parse::<TaskStatus>()?,
        created_at: from_ts(row.get("created_at")),
        started_at: row.get::<Option<i64>, _>("started_at").map(from_ts),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_ts),
        error_message: row.get("error_message"),
        result_summary: summary.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn json_list(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Vec<String>> {
    let raw: String = row.get(column);
    serde_json::from_str(&raw).with_context(|| format!("Malformed {} column", column))
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_only_moves_to_started() {
        for to in TaskStatus::ALL {
            assert_eq!(
                TaskStatus::Queued.can_transition_to(to),
                to == TaskStatus::Started,
                "queued -> {}",
                to
            );
        }
    }

    #[test]
    fn started_moves_to_terminal_states_only() {
        let reachable: Vec<TaskStatus> = TaskStatus::ALL
            .into_iter()
            .filter(|to| TaskStatus::Started.can_transition_to(*to))
            .collect();
        assert_eq!(
            reachable,
            vec![
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled
            ]
        );
        assert!(reachable.iter().all(|s| s.is_terminal()));
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for from in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn sources_of_cancelled_is_started() {
        assert_eq!(
            TaskStatus::sources_of(TaskStatus::Cancelled),
            vec![TaskStatus::Started]
        );
        assert_eq!(
            TaskStatus::sources_of(TaskStatus::Started),
            vec![TaskStatus::Queued]
        );
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }
}
