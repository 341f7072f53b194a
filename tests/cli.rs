use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use chrono::NaiveDate;
use session_curator::config::load_config;
use session_curator::models::TaskParams;
use session_curator::task::{TaskStatus, TaskStore};

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/curator.sqlite"

[analytics]
base_url = "http://127.0.0.1:9"

[ai_controller]
base_url = "http://127.0.0.1:9"

[curation]
base_url = "http://127.0.0.1:9"

[pipeline]
params_dir = "{root}/params"

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("curator.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_curator(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_curator"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run curator binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_curator(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/curator.sqlite").exists());

    // idempotent
    let (_, _, ok) = run_curator(&config, &["init"]);
    assert!(ok);
}

#[test]
fn empty_store_lists_no_tasks() {
    let (_tmp, config) = setup_test_env();
    run_curator(&config, &["init"]);

    let (stdout, stderr, ok) = run_curator(&config, &["task", "list"]);
    assert!(ok, "task list failed: {}", stderr);
    assert!(stdout.contains("No tasks."));

    let (stdout, _, ok) = run_curator(&config, &["summary"]);
    assert!(ok);
    assert!(stdout.contains("Total:        0"));
    assert!(stdout.contains("In progress:  0"));
}

#[test]
fn show_and_cancel_fail_for_unknown_task() {
    let (_tmp, config) = setup_test_env();
    run_curator(&config, &["init"]);

    let (_, stderr, ok) = run_curator(&config, &["task", "show", "missing"]);
    assert!(!ok);
    assert!(stderr.contains("task not found"));

    let (_, _, ok) = run_curator(&config, &["task", "cancel", "missing"]);
    assert!(!ok);
}

#[test]
fn create_rejects_inverted_date_range() {
    let (_tmp, config) = setup_test_env();
    run_curator(&config, &["init"]);

    let (_, stderr, ok) = run_curator(
        &config,
        &[
            "task",
            "create",
            "--user",
            "ops",
            "--client",
            "acme",
            "--from",
            "2025-09-01",
            "--to",
            "2025-08-01",
            "--categories",
            "chips",
            "--photo-types",
            "shelf",
            "--channels",
            "mt",
            "--dataset",
            "384",
            "--budget",
            "10",
        ],
    );
    assert!(!ok);
    assert!(stderr.contains("after end_date"));

    let (stdout, _, _) = run_curator(&config, &["task", "list"]);
    assert!(stdout.contains("No tasks."));
}

#[test]
fn missing_config_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let (_, _, ok) = run_curator(&tmp.path().join("nope.toml"), &["task", "list"]);
    assert!(!ok);
}

#[tokio::test]
async fn runner_records_failure_when_params_file_is_missing() {
    let (tmp, config) = setup_test_env();
    let cfg = load_config(&config).unwrap();
    let store = TaskStore::open(&cfg).await.unwrap();
    store
        .create(
            "t-missing",
            &TaskParams {
                client_id: "acme".into(),
                start_date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2025, 8, 31).unwrap(),
                photo_types: vec!["shelf".into()],
                category_types: vec!["chips".into()],
                channel_types: vec!["mt".into()],
                dataset_id: 384,
                version_name: "v1".into(),
                sample_per_channel: 10,
                username: "ops".into(),
                user_email: None,
            },
        )
        .await
        .unwrap();

    let params_file = tmp.path().join("params/t-missing.json");
    let (_, stderr, ok) = run_curator(
        &config,
        &[
            "run-task",
            "t-missing",
            params_file.to_str().unwrap(),
            "--progress",
            "off",
        ],
    );
    assert!(ok, "runner exited with error: {}", stderr);
    assert!(stderr.contains("Task failed"));

    let record = store.get("t-missing").await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record
        .error_message
        .unwrap()
        .contains("cannot read params file"));
}
