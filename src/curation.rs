//! Curation platform client: dataset resolution, session upload, and
//! dataset administration.
//!
//! # Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `GET`  | `/datasets/` | Paginated dataset listing (`{results, next}`) |
//! | `POST` | `/session/upload/` | One [`CurationUploadRecord`] per call |
//! | `POST` | `/dataset/` | Create a dataset; body is `[DatasetConfig]` |
//! | `PUT`  | `/dataset/` | Update a dataset; body is `[DatasetConfig]` |
//! | `POST` | `/dataset/label/` | Append labels at one level |
//!
//! All calls carry `Authorization: Token <token>`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

use crate::cancel::{StageContext, StageResult};
use crate::config::{secret_from_env, Config};
use crate::error::CuratorError;
use crate::http::{self, collect_pages, follow_with, token_header};
use crate::models::{CurationUploadRecord, ProcessedDocument, UploadTarget};
use crate::progress::{Stage, StageProgressEvent};

#[async_trait]
pub trait CurationUploader: Send + Sync {
    /// Title of the dataset with this id.
    ///
    /// Fails with [`CuratorError::DatasetNotFound`] when no dataset matches.
    async fn resolve_dataset_name(&self, dataset_id: i64) -> Result<String>;

    async fn upload_session(&self, record: &CurationUploadRecord<'_>) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct DatasetEntry {
    id: i64,
    #[serde(default)]
    title: String,
}

pub struct CurationClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl CurationClient {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let token = secret_from_env(&config.curation.token_env)?;
        Self::new(&config.curation.base_url, token, config.http.timeout())
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", token_header(&self.token))
    }

    /// Create a dataset from a freshly built config.
    pub async fn create_dataset(&self, config: &DatasetConfig) -> Result<Value> {
        http::fetch_json(self.request(Method::POST, "/dataset/").json(&[config]))
            .await
            .context("dataset create failed")
    }

    /// Update dataset `dataset_id`, looking up its current title first.
    pub async fn update_dataset(&self, dataset_id: i64, spec: DatasetSpec) -> Result<Value> {
        let title = self.resolve_dataset_name(dataset_id).await?;
        let config = DatasetConfig::for_update(dataset_id, title, spec);
        http::fetch_json(self.request(Method::PUT, "/dataset/").json(&[config]))
            .await
            .context("dataset update failed")
    }

    /// Post labels in batches of `batch_size`, plus one final flush.
    pub async fn add_labels(
        &self,
        dataset_id: i64,
        level: LabelLevel,
        labels: Vec<Label>,
        batch_size: usize,
    ) -> Result<LabelUploadReport> {
        let mut report = LabelUploadReport::default();
        for batch in label_batches(dataset_id, level, labels, batch_size) {
            let count = batch.len();
            tracing::info!(dataset_id, level = level.as_str(), count, "adding labels");
            let response: Value =
                http::fetch_json(self.request(Method::POST, "/dataset/label/").json(&batch))
                    .await
                    .with_context(|| format!("label batch {} failed", report.batches + 1))?;
            report.batches += 1;
            report.labels += count;
            report.last_response = Some(response);
        }
        Ok(report)
    }
}

#[async_trait]
impl CurationUploader for CurationClient {
    async fn resolve_dataset_name(&self, dataset_id: i64) -> Result<String> {
        let listing = collect_pages::<DatasetEntry, _>(
            self.request(Method::GET, "/datasets/"),
            follow_with(
                &self.client,
                Method::GET,
                vec![("Authorization", token_header(&self.token))],
            ),
        )
        .await;

        if let Some(found) = listing.items.into_iter().find(|d| d.id == dataset_id) {
            return Ok(found.title);
        }
        // Only a complete listing proves the id is absent.
        match listing.error {
            Some(e) => Err(e.context(format!(
                "dataset listing failed after {} page(s), before id {} was found",
                listing.pages, dataset_id
            ))),
            None => Err(CuratorError::DatasetNotFound(dataset_id).into()),
        }
    }

    async fn upload_session(&self, record: &CurationUploadRecord<'_>) -> Result<()> {
        http::send_checked(self.request(Method::POST, "/session/upload/").json(record)).await
    }
}

// ============ Bulk upload ============

#[derive(Debug, Default)]
pub struct UploadReport {
    pub uploaded: usize,
    pub failed_ids: Vec<String>,
}

/// Upload every document in order, polling for cancellation.
///
/// A failed upload is recorded against the document's `session_id` and the
/// loop moves on.
pub async fn upload_documents(
    uploader: &dyn CurationUploader,
    target: &UploadTarget,
    documents: &[ProcessedDocument],
    ctx: &StageContext<'_>,
) -> StageResult<UploadReport> {
    let total = documents.len() as u64;
    ctx.progress.report(StageProgressEvent::Started {
        stage: Stage::Upload,
        total: Some(total),
    });

    let mut report = UploadReport::default();
    for (i, document) in documents.iter().enumerate() {
        if i > 0 && ctx.should_stop(i).await {
            return StageResult::Cancelled;
        }
        match uploader.upload_session(&target.record(document)).await {
            Ok(()) => report.uploaded += 1,
            Err(e) => {
                tracing::warn!(session_id = %document.session_id, error = %e, "upload failed");
                report.failed_ids.push(document.session_id.clone());
            }
        }
        ctx.progress.report(StageProgressEvent::Advanced {
            stage: Stage::Upload,
            n: i as u64 + 1,
            total,
        });
    }

    ctx.progress.report(StageProgressEvent::Finished {
        stage: Stage::Upload,
        count: report.uploaded as u64,
    });
    StageResult::Done(report)
}

// ============ Dataset configuration ============

/// A tier flag: a boolean when the input spelled one, otherwise the raw text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Text(String),
}

impl Default for FlagValue {
    fn default() -> Self {
        FlagValue::Bool(false)
    }
}

/// `"true"`/`"false"` in any case become booleans; anything else is kept verbatim.
pub fn coerce_flag(raw: &str) -> FlagValue {
    if raw.eq_ignore_ascii_case("true") {
        FlagValue::Bool(true)
    } else if raw.eq_ignore_ascii_case("false") {
        FlagValue::Bool(false)
    } else {
        FlagValue::Text(raw.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierFlags {
    pub category: FlagValue,
    pub brand: FlagValue,
    pub brand_form: FlagValue,
    pub variant: FlagValue,
    pub sku: FlagValue,
}

impl TierFlags {
    /// Build from raw strings in category, brand, brand form, variant, sku order.
    pub fn from_raw(raw: [&str; 5]) -> Self {
        let [category, brand, brand_form, variant, sku] = raw.map(coerce_flag);
        Self {
            category,
            brand,
            brand_form,
            variant,
            sku,
        }
    }
}

/// What the operator supplies for a dataset create or update.
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub title: String,
    pub curation_type: String,
    pub version_title: String,
    pub detection: TierFlags,
    pub classification: TierFlags,
    pub text: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub curation_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionTitle {
    pub title: String,
}

/// Request body element for `/dataset/`. Built fresh for each call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetConfig {
    pub dataset: DatasetHeader,
    pub version: Vec<VersionTitle>,
    pub detection: TierFlags,
    pub classification: TierFlags,
    pub text: bool,
}

impl DatasetConfig {
    pub fn for_create(spec: DatasetSpec) -> Self {
        Self::build(None, spec.title.clone(), spec)
    }

    pub fn for_update(dataset_id: i64, resolved_title: String, spec: DatasetSpec) -> Self {
        Self::build(Some(dataset_id), resolved_title, spec)
    }

    fn build(id: Option<i64>, title: String, spec: DatasetSpec) -> Self {
        Self {
            dataset: DatasetHeader {
                id,
                title,
                curation_type: spec.curation_type,
            },
            version: vec![VersionTitle {
                title: spec.version_title,
            }],
            detection: spec.detection,
            classification: spec.classification,
            text: spec.text,
        }
    }
}

// ============ Labels ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelLevel {
    Category,
    Brand,
    Brandform,
    Variant,
    Sku,
    Text,
}

impl LabelLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LabelLevel::Category => "category",
            LabelLevel::Brand => "brand",
            LabelLevel::Brandform => "brandform",
            LabelLevel::Variant => "variant",
            LabelLevel::Sku => "sku",
            LabelLevel::Text => "text",
        }
    }
}

impl FromStr for LabelLevel {
    type Err = CuratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "category" => Ok(LabelLevel::Category),
            "brand" => Ok(LabelLevel::Brand),
            "brandform" => Ok(LabelLevel::Brandform),
            "variant" => Ok(LabelLevel::Variant),
            "sku" => Ok(LabelLevel::Sku),
            "text" => Ok(LabelLevel::Text),
            _ => Err(CuratorError::UnknownLabelLevel(s.to_string())),
        }
    }
}

/// One label: display `title` from the mapping column, `name` from the
/// internal column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Label {
    pub title: String,
    pub name: String,
}

/// Body of one `/dataset/label/` call. Only the chosen level is populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelBatch {
    pub id: i64,
    pub category: Vec<Label>,
    pub brand: Vec<Label>,
    pub brandform: Vec<Label>,
    pub variant: Vec<Label>,
    pub sku: Vec<Label>,
    pub text: Vec<Label>,
}

impl LabelBatch {
    fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn bucket(&mut self, level: LabelLevel) -> &mut Vec<Label> {
        match level {
            LabelLevel::Category => &mut self.category,
            LabelLevel::Brand => &mut self.brand,
            LabelLevel::Brandform => &mut self.brandform,
            LabelLevel::Variant => &mut self.variant,
            LabelLevel::Sku => &mut self.sku,
            LabelLevel::Text => &mut self.text,
        }
    }

    pub fn len(&self) -> usize {
        self.category.len()
            + self.brand.len()
            + self.brandform.len()
            + self.variant.len()
            + self.sku.len()
            + self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split labels into request bodies of at most `batch_size` entries.
///
/// The final body is always produced, even when it is empty.
pub fn label_batches(
    dataset_id: i64,
    level: LabelLevel,
    labels: Vec<Label>,
    batch_size: usize,
) -> Vec<LabelBatch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current = LabelBatch::new(dataset_id);
    for label in labels {
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, LabelBatch::new(dataset_id)));
        }
        current.bucket(level).push(label);
    }
    batches.push(current);
    batches
}

#[derive(Debug, Default)]
pub struct LabelUploadReport {
    pub batches: usize,
    pub labels: usize,
    pub last_response: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(n: usize) -> Vec<Label> {
        (0..n)
            .map(|i| Label {
                title: format!("Title {}", i),
                name: format!("name_{}", i),
            })
            .collect()
    }

    #[test]
    fn coercion_recognises_booleans_case_insensitively() {
        assert_eq!(coerce_flag("true"), FlagValue::Bool(true));
        assert_eq!(coerce_flag("FALSE"), FlagValue::Bool(false));
        assert_eq!(coerce_flag("True"), FlagValue::Bool(true));
        assert_eq!(coerce_flag("maybe"), FlagValue::Text("maybe".into()));
    }

    #[test]
    fn flags_serialize_as_bool_or_text() {
        let flags = TierFlags::from_raw(["true", "false", "maybe", "TRUE", "no"]);
        let v = serde_json::to_value(&flags).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "category": true, "brand": false, "brand_form": "maybe",
                "variant": true, "sku": "no"
            })
        );
    }

    fn spec() -> DatasetSpec {
        DatasetSpec {
            title: "Snacks".into(),
            curation_type: "bounding-box".into(),
            version_title: "v1".into(),
            detection: TierFlags::from_raw(["true", "false", "false", "false", "true"]),
            classification: TierFlags::default(),
            text: false,
        }
    }

    #[test]
    fn create_config_omits_dataset_id() {
        let v = serde_json::to_value(DatasetConfig::for_create(spec())).unwrap();
        assert!(v["dataset"].get("id").is_none());
        assert_eq!(v["dataset"]["title"], "Snacks");
        assert_eq!(v["version"][0]["title"], "v1");
        assert_eq!(v["detection"]["sku"], true);
    }

    #[test]
    fn update_config_uses_resolved_title() {
        let cfg = DatasetConfig::for_update(384, "Existing".into(), spec());
        assert_eq!(cfg.dataset.id, Some(384));
        assert_eq!(cfg.dataset.title, "Existing");
        // configs do not share state between calls
        let again = DatasetConfig::for_create(spec());
        assert_eq!(again.dataset.id, None);
        assert_eq!(again.dataset.title, "Snacks");
    }

    #[test]
    fn label_level_parses_and_rejects() {
        assert_eq!("Brandform".parse::<LabelLevel>().unwrap(), LabelLevel::Brandform);
        assert!(matches!(
            "shelf".parse::<LabelLevel>(),
            Err(CuratorError::UnknownLabelLevel(_))
        ));
    }

    #[test]
    fn label_batches_flush_at_threshold_and_at_end() {
        let batches = label_batches(7, LabelLevel::Sku, labels(1000), 490);
        let sizes: Vec<usize> = batches.iter().map(|b| b.sku.len()).collect();
        assert_eq!(sizes, vec![490, 490, 20]);
        assert!(batches.iter().all(|b| b.id == 7 && b.brand.is_empty()));
    }

    #[test]
    fn exact_multiple_leaves_full_final_batch() {
        let batches = label_batches(7, LabelLevel::Brand, labels(980), 490);
        let sizes: Vec<usize> = batches.iter().map(|b| b.brand.len()).collect();
        assert_eq!(sizes, vec![490, 490]);
    }

    #[test]
    fn empty_labels_still_flush_once() {
        let batches = label_batches(7, LabelLevel::Text, Vec::new(), 490);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
    }
}
