//! `curator task …` commands: create, list, show and cancel.

use anyhow::Result;

use crate::config::Config;
use crate::runner::{self, RunnerLauncher, TaskRequest};
use crate::task::{TaskRecord, TaskStore};

pub async fn run_task_create(
    config: &Config,
    launcher: &dyn RunnerLauncher,
    request: TaskRequest,
) -> Result<()> {
    let store = TaskStore::open(config).await?;
    let task_id = runner::submit_task(config, &store, launcher, request.into_params()).await?;
    println!("{}", task_id);
    Ok(())
}

pub async fn run_task_list(config: &Config, username: Option<&str>) -> Result<()> {
    let store = TaskStore::open(config).await?;
    let tasks = store.list(username).await?;

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<12}  {:<16}  {:>8}  CREATED",
        "TASK", "STATUS", "USER", "CLIENT", "DATASET"
    );
    for t in &tasks {
        println!(
            "{:<36}  {:<10}  {:<12}  {:<16}  {:>8}  {}",
            t.task_id,
            t.status,
            t.params.username,
            t.params.client_id,
            t.params.dataset_id,
            t.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn run_task_show(config: &Config, task_id: &str) -> Result<()> {
    let store = TaskStore::open(config).await?;
    let task = match store.get(task_id).await? {
        Some(t) => t,
        None => {
            eprintln!("Error: task not found: {}", task_id);
            std::process::exit(1);
        }
    };
    print_task(&task);
    Ok(())
}

pub async fn run_task_cancel(config: &Config, task_id: &str) -> Result<()> {
    let store = TaskStore::open(config).await?;
    store.cancel(task_id).await?;
    println!("Task {} cancelled.", task_id);
    Ok(())
}

fn print_task(task: &TaskRecord) {
    let p = &task.params;
    println!("--- Task ---");
    println!("task_id:            {}", task.task_id);
    println!("status:             {}", task.status);
    println!("username:           {}", p.username);
    if let Some(email) = &p.user_email {
        println!("user_email:         {}", email);
    }
    println!("client_id:          {}", p.client_id);
    println!("dates:              {} .. {}", p.start_date, p.end_date);
    println!("categories:         {}", p.category_types.join(", "));
    println!("photo_types:        {}", p.photo_types.join(", "));
    println!("channels:           {}", p.channel_types.join(", "));
    println!("dataset_id:         {}", p.dataset_id);
    println!("version_name:       {}", p.version_name);
    println!("sample_per_channel: {}", p.sample_per_channel);
    println!("created_at:         {}", task.created_at.to_rfc3339());
    if let Some(ts) = task.started_at {
        println!("started_at:         {}", ts.to_rfc3339());
    }
    if let Some(ts) = task.completed_at {
        println!("completed_at:       {}", ts.to_rfc3339());
    }

    if let Some(summary) = &task.result_summary {
        println!();
        println!("--- Result ---");
        match serde_json::to_string_pretty(summary) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{}", summary),
        }
    }
    if let Some(error) = &task.error_message {
        println!();
        println!("--- Error ---");
        println!("{}", error);
    }
}
