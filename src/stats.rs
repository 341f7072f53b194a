//! Read-only views: task summary, candidate preview, filter metadata.
//!
//! `curator summary` gives the counts-by-status overview. `curator preview`
//! runs stage 1 and the sampler without touching the task store or the
//! curation platform, so an operator can size a task before launching it.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::sampler::{dedup_sessions, sample_sessions};
use crate::session_source::{
    candidate_stats, collect_candidates, flatten, AnalyticsClient, CandidateStats, SessionQuery,
};
use crate::task::TaskStore;

pub async fn run_summary(config: &Config, username: Option<&str>) -> Result<()> {
    let store = TaskStore::open(config).await?;
    let counts = store.status_counts(username).await?;

    println!("Session Curator: Task Summary");
    println!("=============================");
    println!();
    if let Some(user) = username {
        println!("  User:         {}", user);
        println!();
    }
    println!("  Total:        {}", counts.total);
    println!("  Completed:    {}", counts.completed);
    println!("  In progress:  {}", counts.in_progress());
    println!("  Failed:       {}", counts.failed);
    println!("  Cancelled:    {}", counts.cancelled);
    println!();
    Ok(())
}

/// Outcome of a dry candidate search.
#[derive(Debug, Serialize)]
pub struct Preview {
    pub stats: CandidateStats,
    pub unique_sessions: usize,
    pub sampled_sessions: usize,
    pub sampled_images: u64,
}

pub async fn preview(config: &Config, query: &SessionQuery, budget: u64) -> Result<Preview> {
    let client = AnalyticsClient::from_config(config)?;
    let batches = collect_candidates(&client, query).await;
    let stats = candidate_stats(&query.client_id, &batches);

    let candidates = dedup_sessions(flatten(batches));
    let sampled = sample_sessions(&candidates, budget, config.pipeline.group_by);

    Ok(Preview {
        stats,
        unique_sessions: candidates.len(),
        sampled_sessions: sampled.len(),
        sampled_images: sampled.iter().map(|s| s.num_images).sum(),
    })
}

pub async fn run_preview(config: &Config, query: &SessionQuery, budget: u64, json: bool) -> Result<()> {
    let p = preview(config, query, budget).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&p)?);
        return Ok(());
    }

    println!(
        "  {:<20} {:<14} {:<16} {:>9} {:>9} {:>7} {:>8}",
        "CATEGORY", "PHOTO TYPE", "CHANNEL", "SESSIONS", "IMAGES", "STORES", "AVG"
    );
    println!("  {}", "-".repeat(90));
    for c in &p.stats.combinations {
        println!(
            "  {:<20} {:<14} {:<16} {:>9} {:>9} {:>7} {:>8.1}",
            c.category,
            c.photo_type,
            c.channel,
            c.num_sessions,
            c.num_images,
            c.num_unique_stores,
            c.average_images_per_session
        );
    }
    println!();
    println!("  Sessions:        {}", p.stats.total_num_sessions);
    println!("  Images:          {}", p.stats.total_num_images);
    println!("  Unique stores:   {}", p.stats.total_num_unique_stores);
    println!("  Unique images:   {}", p.stats.total_num_unique_images);
    println!("  Unique sessions: {}", p.unique_sessions);
    println!(
        "  Sample:          {} sessions, {} images (budget {} per group)",
        p.sampled_sessions, p.sampled_images, budget
    );
    Ok(())
}

pub async fn run_metadata(config: &Config, client_id: &str) -> Result<()> {
    let client = AnalyticsClient::from_config(config)?;
    let options = client.filter_options(client_id).await?;

    for (title, names) in [
        ("Photo types", &options.photo_types),
        ("Categories", &options.categories),
        ("Channels", &options.channels),
    ] {
        println!("{} ({}):", title, names.len());
        for name in names {
            println!("  {}", name);
        }
    }
    Ok(())
}
