//! Core data models used throughout the curator.
//!
//! These types represent the sessions, processed documents and task
//! parameters that flow through the fetch → download → upload pipeline.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CuratorError;

/// A shelf-image session as listed by the analytics provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub store_id: String,
    pub store_channel_id: String,
    pub category_name: String,
    pub num_images: u64,
}

/// The AI controller's output for one session.
///
/// Only `status` and `session_id` are interpreted; the rest of the payload
/// is forwarded to the curation platform as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDocument {
    pub session_id: String,
    pub payload: Value,
}

impl ProcessedDocument {
    /// Wrap a dereferenced output document, accepting only `status == "success"`.
    pub fn from_payload(payload: Value) -> Option<Self> {
        if payload.get("status").and_then(Value::as_str) != Some("success") {
            return None;
        }
        let session_id = match payload.get("session_id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        Some(Self {
            session_id,
            payload,
        })
    }
}

/// Request body accepted by the curation platform's session upload endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CurationUploadRecord<'a> {
    pub session: &'a Value,
    pub softtags: &'a [String],
    pub dataset: &'a str,
    pub version: &'a str,
}

/// Where uploads land: a resolved dataset plus version and softtags.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub dataset_id: i64,
    pub dataset_name: String,
    pub version_name: String,
    pub softtags: Vec<String>,
}

impl UploadTarget {
    pub fn record<'a>(&'a self, document: &'a ProcessedDocument) -> CurationUploadRecord<'a> {
        CurationUploadRecord {
            session: &document.payload,
            softtags: &self.softtags,
            dataset: &self.dataset_name,
            version: &self.version_name,
        }
    }
}

/// The full parameter bundle for one task.
///
/// This is what launchers write to the params file handed to the detached
/// runner, and what the task record stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub client_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub photo_types: Vec<String>,
    pub category_types: Vec<String>,
    pub channel_types: Vec<String>,
    pub dataset_id: i64,
    pub version_name: String,
    pub sample_per_channel: u64,
    pub username: String,
    #[serde(default)]
    pub user_email: Option<String>,
}

impl TaskParams {
    pub fn validate(&self) -> Result<(), CuratorError> {
        if self.client_id.trim().is_empty() {
            return Err(CuratorError::InvalidParams("client_id is empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(CuratorError::InvalidParams("username is empty".into()));
        }
        if self.start_date > self.end_date {
            return Err(CuratorError::InvalidParams(format!(
                "start_date {} is after end_date {}",
                self.start_date, self.end_date
            )));
        }
        for (name, set) in [
            ("photo_types", &self.photo_types),
            ("category_types", &self.category_types),
            ("channel_types", &self.channel_types),
        ] {
            if set.is_empty() {
                return Err(CuratorError::InvalidParams(format!("{} is empty", name)));
            }
        }
        if self.dataset_id < 1 {
            return Err(CuratorError::InvalidParams("dataset_id must be >= 1".into()));
        }
        if self.sample_per_channel < 1 {
            return Err(CuratorError::InvalidParams(
                "sample_per_channel must be >= 1".into(),
            ));
        }
        if self.version_name.trim().is_empty() {
            return Err(CuratorError::InvalidParams("version_name is empty".into()));
        }
        Ok(())
    }
}

/// Version name used when the caller leaves it blank.
pub fn default_version_name(category_types: &[String]) -> String {
    format!(
        "{}_{}",
        category_types.join(","),
        Utc::now().format("%Y-%m-%d_%H%M%S")
    )
}

/// Split a comma-separated filter value into trimmed, non-empty names.
pub fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Counts recorded on a task when it completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total_candidates: usize,
    pub sampled_sessions: usize,
    pub downloaded_documents: usize,
    pub failed_downloads: usize,
    pub uploaded: usize,
    pub failed_uploads: usize,
    pub failed_upload_ids: Vec<String>,
    pub dataset_id: i64,
    pub dataset_name: String,
    pub version_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> TaskParams {
        TaskParams {
            client_id: "acme".into(),
            start_date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 10, 31).unwrap(),
            photo_types: vec!["shelf".into()],
            category_types: vec!["popcorn".into()],
            channel_types: vec!["supermarket".into()],
            dataset_id: 384,
            version_name: "v1".into(),
            sample_per_channel: 800,
            username: "ops".into(),
            user_email: None,
        }
    }

    #[test]
    fn valid_params_pass() {
        assert!(params().validate().is_ok());
    }

    #[test]
    fn reversed_dates_rejected() {
        let mut p = params();
        p.start_date = NaiveDate::from_ymd_opt(2025, 11, 1).unwrap();
        assert!(matches!(p.validate(), Err(CuratorError::InvalidParams(_))));
    }

    #[test]
    fn empty_filter_set_rejected() {
        let mut p = params();
        p.channel_types.clear();
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("channel_types"));
    }

    #[test]
    fn split_names_trims_and_skips_blanks() {
        assert_eq!(
            split_names(" sup-mkt , ,sml-grcry "),
            vec!["sup-mkt".to_string(), "sml-grcry".to_string()]
        );
    }

    #[test]
    fn only_success_documents_accepted() {
        let ok = ProcessedDocument::from_payload(json!({"status": "success", "session_id": "s1"}));
        assert_eq!(ok.unwrap().session_id, "s1");
        assert!(ProcessedDocument::from_payload(json!({"status": "failure"})).is_none());
        assert!(ProcessedDocument::from_payload(json!({"session_id": "s2"})).is_none());
    }
}
