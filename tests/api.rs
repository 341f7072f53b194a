//! HTTP API tests.
//!
//! The router is served on a free local port with a recording launcher in
//! place of the detached runner, and exercised with a real HTTP client.

use anyhow::bail;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use session_curator::config::{parse_config, Config};
use session_curator::models::ResultSummary;
use session_curator::runner::RunnerLauncher;
use session_curator::server;
use session_curator::task::{TaskStatus, TaskStore};

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<(String, PathBuf)>>,
    fail: bool,
}

impl RunnerLauncher for RecordingLauncher {
    fn launch(&self, task_id: &str, params_file: &Path) -> anyhow::Result<()> {
        if self.fail {
            bail!("no runner available");
        }
        self.launched
            .lock()
            .unwrap()
            .push((task_id.to_string(), params_file.to_path_buf()));
        Ok(())
    }
}

fn test_config(tmp: &TempDir) -> Config {
    parse_config(&format!(
        r#"[db]
path = "{root}/curator.sqlite"

[analytics]
base_url = "http://127.0.0.1:9"

[ai_controller]
base_url = "http://127.0.0.1:9"

[curation]
base_url = "http://127.0.0.1:9"

[pipeline]
params_dir = "{root}/params"
"#,
        root = tmp.path().display()
    ))
    .unwrap()
}

struct TestApi {
    base: String,
    store: TaskStore,
    launcher: Arc<RecordingLauncher>,
    http: reqwest::Client,
    _tmp: TempDir,
}

async fn start_api(launcher: RecordingLauncher) -> TestApi {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = TaskStore::open(&config).await.unwrap();
    let launcher = Arc::new(launcher);
    let app = server::router(config, store.clone(), launcher.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    TestApi {
        base: format!("http://{}", addr),
        store,
        launcher,
        http: reqwest::Client::new(),
        _tmp: tmp,
    }
}

fn task_body() -> Value {
    json!({
        "client_id": " acme ",
        "start_date": "2025-08-01",
        "end_date": "2025-08-31",
        "photo_types": ["shelf"],
        "category_types": ["chips"],
        "channel_types": ["mt", "gt"],
        "dataset_id": 384,
        "sample_per_channel": 100,
        "username": "ops"
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let api = start_api(RecordingLauncher::default()).await;
    let resp = api.http.get(format!("{}/health", api.base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn create_task_queues_record_and_launches_runner() {
    let api = start_api(RecordingLauncher::default()).await;
    let resp = api
        .http
        .post(format!("{}/tasks", api.base))
        .json(&task_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let launched = api.launcher.launched.lock().unwrap().clone();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].0, task_id);
    assert!(launched[0].1.exists());

    let record = api.store.get(&task_id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Queued);
    assert_eq!(record.params.client_id, "acme");
    assert!(record.params.version_name.starts_with("chips_"));

    let resp = api
        .http
        .get(format!("{}/tasks/{}", api.base, task_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["task_id"], task_id.as_str());
    assert_eq!(body["status"], "queued");
}

#[tokio::test]
async fn malformed_dates_are_rejected() {
    let api = start_api(RecordingLauncher::default()).await;
    let mut body = task_body();
    body["start_date"] = json!("01/08/2025");

    let resp = api
        .http
        .post(format!("{}/tasks", api.base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "bad_request");
    assert!(api.store.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_params_are_rejected_before_anything_is_stored() {
    let api = start_api(RecordingLauncher::default()).await;
    let mut body = task_body();
    body["start_date"] = json!("2025-09-01");

    let resp = api
        .http
        .post(format!("{}/tasks", api.base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "bad_request");
    assert!(api.launcher.launched.lock().unwrap().is_empty());
    assert!(api.store.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn launch_failure_marks_task_failed() {
    let api = start_api(RecordingLauncher {
        fail: true,
        ..Default::default()
    })
    .await;

    let resp = api
        .http
        .post(format!("{}/tasks", api.base))
        .json(&task_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    let tasks = api.store.list(None).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert!(tasks[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("no runner available"));
}

#[tokio::test]
async fn missing_task_is_not_found() {
    let api = start_api(RecordingLauncher::default()).await;
    let resp = api
        .http
        .get(format!("{}/tasks/does-not-exist", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "not_found");

    let resp = api
        .http
        .post(format!("{}/tasks/does-not-exist/cancel", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn cancel_only_applies_to_started_tasks() {
    let api = start_api(RecordingLauncher::default()).await;
    let resp = api
        .http
        .post(format!("{}/tasks", api.base))
        .json(&task_body())
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let task_id = body["task_id"].as_str().unwrap().to_string();
    let cancel_url = format!("{}/tasks/{}/cancel", api.base, task_id);

    let resp = api.http.post(&cancel_url).send().await.unwrap();
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "conflict");

    api.store.mark_started(&task_id).await.unwrap();
    let resp = api.http.post(&cancel_url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"task_id": task_id, "status": "cancelled"}));
    assert_eq!(
        api.store.status(&task_id).await.unwrap(),
        Some(TaskStatus::Cancelled)
    );
}

#[tokio::test]
async fn list_and_summary_filter_by_username() {
    let api = start_api(RecordingLauncher::default()).await;
    for user in ["ops", "ops", "qa"] {
        let mut body = task_body();
        body["username"] = json!(user);
        let resp = api
            .http
            .post(format!("{}/tasks", api.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
    }
    let tasks = api.store.list(Some("ops")).await.unwrap();
    api.store.mark_started(&tasks[0].task_id).await.unwrap();
    api.store
        .mark_completed(&tasks[0].task_id, &ResultSummary::default())
        .await
        .unwrap();

    let listed: Value = api
        .http
        .get(format!("{}/tasks?username=ops", api.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["tasks"].as_array().unwrap().len(), 2);

    let summary: Value = api
        .http
        .get(format!("{}/summary", api.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["total"], 3);
    assert_eq!(summary["completed"], 1);
    assert_eq!(summary["queued"], 2);
    assert_eq!(summary["in_progress"], 2);

    let qa: Value = api
        .http
        .get(format!("{}/summary?username=qa", api.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(qa["total"], 1);
}
