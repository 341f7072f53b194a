//! AI controller: resolve a session to its processed output document.
//!
//! Resolution takes two hops. The processed-session endpoint returns an
//! array whose first element carries an `output` URL; that URL serves the
//! document itself. Only documents whose `status` is `"success"` are kept.
//!
//! Nothing in this module propagates a failure upward. A transport error,
//! non-2xx status, timeout, or malformed body at either hop yields `None`
//! for that session and a `warn` log line.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::cancel::{StageContext, StageResult};
use crate::config::{secret_from_env, Config};
use crate::http;
use crate::models::ProcessedDocument;
use crate::progress::{Stage, StageProgressEvent};

const DEFAULT_CATEGORY_LABEL: &str = "product-in-shelf";
const DEFAULT_CATEGORY_SCORE: f64 = 0.93;

#[async_trait]
pub trait OutputFetcher: Send + Sync {
    /// The accepted, backfilled document for `session_id`, or `None`.
    async fn fetch_output(&self, client_id: &str, session_id: &str) -> Option<ProcessedDocument>;
}

#[derive(Debug, Deserialize)]
struct ProcessedSessionEntry {
    output: Option<String>,
}

pub struct AiControllerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AiControllerClient {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = secret_from_env(&config.ai_controller.api_key_env)?;
        Self::new(&config.ai_controller.base_url, api_key, config.http.timeout())
    }

    async fn resolve(&self, client_id: &str, session_id: &str) -> Result<Option<ProcessedDocument>> {
        let entries: Vec<ProcessedSessionEntry> = http::fetch_json(
            self.client
                .get(format!("{}/processed_session/{}/", self.base_url, client_id))
                .query(&[("infiviz_session_id", session_id)])
                .header("APIKEY", &self.api_key),
        )
        .await?;

        let url = entries
            .into_iter()
            .next()
            .and_then(|e| e.output)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow!("no output url"))?;

        let payload: Value = http::fetch_json(self.client.get(&url)).await?;
        Ok(ProcessedDocument::from_payload(payload).map(|mut doc| {
            backfill_category_labels(&mut doc.payload);
            doc
        }))
    }
}

#[async_trait]
impl OutputFetcher for AiControllerClient {
    async fn fetch_output(&self, client_id: &str, session_id: &str) -> Option<ProcessedDocument> {
        match self.resolve(client_id, session_id).await {
            Ok(Some(doc)) => Some(doc),
            Ok(None) => {
                tracing::warn!(session_id, "processed output not successful");
                None
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "processed output fetch failed");
                None
            }
        }
    }
}

/// Give every product a category label when it has none.
///
/// The product's own `item` label and score are copied over; an empty item
/// label falls back to the generic shelf label.
pub fn backfill_category_labels(payload: &mut Value) {
    let Some(images) = payload.get_mut("images").and_then(Value::as_array_mut) else {
        return;
    };
    for image in images {
        let Some(products) = image.get_mut("products").and_then(Value::as_array_mut) else {
            continue;
        };
        for product in products {
            let has_label = product
                .pointer("/category/label")
                .and_then(Value::as_str)
                .is_some_and(|l| !l.is_empty());
            if has_label {
                continue;
            }

            let item_label = product
                .pointer("/item/label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let category = if item_label.is_empty() {
                json!({"label": DEFAULT_CATEGORY_LABEL, "score": DEFAULT_CATEGORY_SCORE})
            } else {
                let score = product.pointer("/item/score").cloned().unwrap_or(Value::Null);
                json!({"label": item_label, "score": score})
            };
            if let Some(obj) = product.as_object_mut() {
                obj.insert("category".to_string(), category);
            }
        }
    }
}

/// Outcome of the download stage.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub documents: Vec<ProcessedDocument>,
    pub failed_ids: Vec<String>,
}

/// Fetch outputs for every id in order, polling for cancellation.
pub async fn fetch_outputs(
    fetcher: &dyn OutputFetcher,
    client_id: &str,
    session_ids: &[String],
    ctx: &StageContext<'_>,
) -> StageResult<FetchReport> {
    let total = session_ids.len() as u64;
    ctx.progress.report(StageProgressEvent::Started {
        stage: Stage::Download,
        total: Some(total),
    });

    let mut report = FetchReport::default();
    for (i, session_id) in session_ids.iter().enumerate() {
        if i > 0 && ctx.should_stop(i).await {
            return StageResult::Cancelled;
        }
        match fetcher.fetch_output(client_id, session_id).await {
            Some(doc) => report.documents.push(doc),
            None => report.failed_ids.push(session_id.clone()),
        }
        ctx.progress.report(StageProgressEvent::Advanced {
            stage: Stage::Download,
            n: i as u64 + 1,
            total,
        });
    }

    ctx.progress.report(StageProgressEvent::Finished {
        stage: Stage::Download,
        count: report.documents.len() as u64,
    });
    StageResult::Done(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationProbe;
    use crate::progress::NoProgress;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves every session and records how many fetches preceded each poll.
    #[derive(Default)]
    struct Recorder {
        fetches: AtomicUsize,
        polls: Mutex<Vec<usize>>,
        cancel_after: Option<usize>,
    }

    #[async_trait]
    impl OutputFetcher for Recorder {
        async fn fetch_output(&self, _client_id: &str, session_id: &str) -> Option<ProcessedDocument> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            ProcessedDocument::from_payload(json!({"status": "success", "session_id": session_id}))
        }
    }

    #[async_trait]
    impl CancellationProbe for Recorder {
        async fn is_cancelled(&self) -> bool {
            let done = self.fetches.load(Ordering::SeqCst);
            self.polls.lock().unwrap().push(done);
            self.cancel_after.is_some_and(|n| done >= n)
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("s{}", i)).collect()
    }

    #[tokio::test]
    async fn default_interval_polls_after_every_tenth_item() {
        let recorder = Recorder::default();
        let ctx = StageContext {
            probe: &recorder,
            check_every: 10,
            progress: &NoProgress,
        };

        let StageResult::Done(report) = fetch_outputs(&recorder, "acme", &ids(25), &ctx).await else {
            panic!("stage stopped without a cancellation");
        };
        assert_eq!(report.documents.len(), 25);
        assert_eq!(*recorder.polls.lock().unwrap(), vec![10, 20]);
    }

    #[tokio::test]
    async fn cancellation_is_seen_at_the_next_interval() {
        let recorder = Recorder {
            cancel_after: Some(5),
            ..Default::default()
        };
        let ctx = StageContext {
            probe: &recorder,
            check_every: 10,
            progress: &NoProgress,
        };

        let result = fetch_outputs(&recorder, "acme", &ids(25), &ctx).await;
        assert!(matches!(result, StageResult::Cancelled));
        assert_eq!(recorder.fetches.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn backfill_uses_item_label_when_present() {
        let mut doc = json!({
            "images": [{"products": [{"item": {"label": "lays", "score": 0.71}}]}]
        });
        backfill_category_labels(&mut doc);
        assert_eq!(doc["images"][0]["products"][0]["category"], json!({"label": "lays", "score": 0.71}));
    }

    #[test]
    fn backfill_falls_back_to_shelf_label() {
        let mut doc = json!({
            "images": [{"products": [
                {"item": {"label": "", "score": 0.2}, "category": {"label": ""}},
                {"category": null}
            ]}]
        });
        backfill_category_labels(&mut doc);
        for product in doc["images"][0]["products"].as_array().unwrap() {
            assert_eq!(product["category"]["label"], "product-in-shelf");
            assert_eq!(product["category"]["score"], 0.93);
        }
    }

    #[test]
    fn backfill_keeps_existing_category() {
        let mut doc = json!({
            "images": [{"products": [{
                "item": {"label": "lays", "score": 0.5},
                "category": {"label": "chips", "score": 0.99}
            }]}]
        });
        let before = doc.clone();
        backfill_category_labels(&mut doc);
        assert_eq!(doc, before);
    }

    #[test]
    fn backfill_tolerates_missing_structure() {
        let mut doc = json!({"status": "success"});
        backfill_category_labels(&mut doc);
        assert_eq!(doc, json!({"status": "success"}));

        let mut doc = json!({"images": [{"no_products": true}]});
        backfill_category_labels(&mut doc);
        assert_eq!(doc["images"][0], json!({"no_products": true}));
    }
}
