//! Analytics provider: session listing and filter metadata.
//!
//! Candidates are gathered by querying every combination of the requested
//! categories × photo types × channels. Each combination is listed through
//! the provider's `next`-cursor pagination; a fault on any page keeps what
//! that combination had collected so far and moves on to the next one.
//!
//! # Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `POST` | `/generic-output/` | Sessions for one combination (paginated) |
//! | `GET`  | `/metadata/` | Photo-type, category and channel names for a client |

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::config::{secret_from_env, Config};
use crate::http::{self, collect_pages, follow_with, token_header};
use crate::models::{Session, TaskParams};

/// Date range, client and filter sets for a candidate search.
#[derive(Debug, Clone)]
pub struct SessionQuery {
    pub client_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub categories: Vec<String>,
    pub photo_types: Vec<String>,
    pub channels: Vec<String>,
}

impl SessionQuery {
    pub fn from_params(params: &TaskParams) -> Self {
        Self {
            client_id: params.client_id.clone(),
            start_date: params.start_date,
            end_date: params.end_date,
            categories: params.category_types.clone(),
            photo_types: params.photo_types.clone(),
            channels: params.channel_types.clone(),
        }
    }

    /// The Cartesian product, categories outermost, channels innermost.
    pub fn combinations(&self) -> Vec<Combination> {
        let mut out =
            Vec::with_capacity(self.categories.len() * self.photo_types.len() * self.channels.len());
        for category in &self.categories {
            for photo_type in &self.photo_types {
                for channel in &self.channels {
                    out.push(Combination {
                        category: category.clone(),
                        photo_type: photo_type.clone(),
                        channel: channel.clone(),
                    });
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Combination {
    pub category: String,
    pub photo_type: String,
    pub channel: String,
}

/// Something that can list sessions for one filter combination.
///
/// Implementations must not fail: a listing fault truncates the result to
/// whatever was gathered before it.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn sessions_for(&self, query: &SessionQuery, combination: &Combination) -> Vec<Session>;
}

/// Sessions returned for one combination.
#[derive(Debug, Clone)]
pub struct CombinationBatch {
    pub combination: Combination,
    pub sessions: Vec<Session>,
}

/// Query every combination in order.
pub async fn collect_candidates(
    source: &dyn SessionSource,
    query: &SessionQuery,
) -> Vec<CombinationBatch> {
    let mut batches = Vec::new();
    for combination in query.combinations() {
        let sessions = source.sessions_for(query, &combination).await;
        tracing::debug!(
            category = %combination.category,
            photo_type = %combination.photo_type,
            channel = %combination.channel,
            sessions = sessions.len(),
            "combination listed"
        );
        batches.push(CombinationBatch {
            combination,
            sessions,
        });
    }
    batches
}

/// Concatenate batches in combination order (duplicates included).
pub fn flatten(batches: Vec<CombinationBatch>) -> Vec<Session> {
    batches.into_iter().flat_map(|b| b.sessions).collect()
}

// ============ Statistics ============

#[derive(Debug, Clone, Serialize)]
pub struct CombinationStats {
    pub category: String,
    pub photo_type: String,
    pub channel: String,
    pub num_sessions: usize,
    pub num_images: u64,
    pub num_unique_stores: usize,
    pub average_images_per_session: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CandidateStats {
    pub client_id: String,
    pub total_num_sessions: usize,
    pub total_num_images: u64,
    /// Sum of per-combination unique store counts.
    pub total_num_unique_stores: usize,
    /// Images of the first session seen for each distinct store.
    pub total_num_unique_images: u64,
    pub combinations: Vec<CombinationStats>,
}

/// Per-combination and overall statistics. Empty combinations are omitted.
pub fn candidate_stats(client_id: &str, batches: &[CombinationBatch]) -> CandidateStats {
    let mut stats = CandidateStats {
        client_id: client_id.to_string(),
        ..Default::default()
    };
    let mut seen_stores: HashSet<&str> = HashSet::new();

    for batch in batches.iter().filter(|b| !b.sessions.is_empty()) {
        let num_sessions = batch.sessions.len();
        let num_images: u64 = batch.sessions.iter().map(|s| s.num_images).sum();
        let num_unique_stores = batch
            .sessions
            .iter()
            .map(|s| s.store_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        for session in &batch.sessions {
            if seen_stores.insert(session.store_id.as_str()) {
                stats.total_num_unique_images += session.num_images;
            }
        }

        stats.total_num_sessions += num_sessions;
        stats.total_num_images += num_images;
        stats.total_num_unique_stores += num_unique_stores;
        stats.combinations.push(CombinationStats {
            category: batch.combination.category.clone(),
            photo_type: batch.combination.photo_type.clone(),
            channel: batch.combination.channel.clone(),
            num_sessions,
            num_images,
            num_unique_stores,
            average_images_per_session: num_images as f64 / num_sessions as f64,
        });
    }

    stats
}

// ============ HTTP client ============

/// Filter names the provider offers for one client.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FilterOptions {
    #[serde(default)]
    pub photo_types: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Client for the analytics provider.
pub struct AnalyticsClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl AnalyticsClient {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build from config, reading the token from the configured env var.
    pub fn from_config(config: &Config) -> Result<Self> {
        let token = secret_from_env(&config.analytics.token_env)?;
        Self::new(&config.analytics.base_url, token, config.http.timeout())
    }

    pub async fn filter_options(&self, client_id: &str) -> Result<FilterOptions> {
        let request = self
            .client
            .get(format!("{}/metadata/", self.base_url))
            .header("Authorization", token_header(&self.token))
            .query(&[("client_id", client_id)]);
        http::fetch_json(request).await
    }
}

#[async_trait]
impl SessionSource for AnalyticsClient {
    async fn sessions_for(&self, query: &SessionQuery, combination: &Combination) -> Vec<Session> {
        let headers = vec![
            ("Authorization", token_header(&self.token)),
            ("CLIENTID", query.client_id.clone()),
        ];

        let start_date = query.start_date.to_string();
        let end_date = query.end_date.to_string();
        let mut first = self
            .client
            .post(format!("{}/generic-output/", self.base_url))
            .query(&[
                ("client", query.client_id.as_str()),
                ("category", combination.category.as_str()),
                ("channel", combination.channel.as_str()),
                ("photo_type", combination.photo_type.as_str()),
                ("from_date", start_date.as_str()),
                ("to_date", end_date.as_str()),
            ]);
        for (name, value) in &headers {
            first = first.header(*name, value);
        }

        let pages = collect_pages::<Session, _>(
            first,
            follow_with(&self.client, Method::POST, headers),
        )
        .await;

        if let Some(e) = pages.error {
            tracing::warn!(
                category = %combination.category,
                photo_type = %combination.photo_type,
                channel = %combination.channel,
                pages = pages.pages,
                kept = pages.items.len(),
                error = %e,
                "session listing cut short"
            );
        }

        pages.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> SessionQuery {
        SessionQuery {
            client_id: "acme".into(),
            start_date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 8, 31).unwrap(),
            categories: vec!["chips".into(), "drinks".into()],
            photo_types: vec!["shelf".into()],
            channels: vec!["mt".into(), "gt".into()],
        }
    }

    fn session(id: &str, store: &str, images: u64) -> Session {
        Session {
            session_id: id.into(),
            store_id: store.into(),
            store_channel_id: "c".into(),
            category_name: "chips".into(),
            num_images: images,
        }
    }

    #[test]
    fn combinations_cover_the_product_in_order() {
        let combos = query().combinations();
        let labels: Vec<String> = combos
            .iter()
            .map(|c| format!("{}/{}/{}", c.category, c.photo_type, c.channel))
            .collect();
        assert_eq!(
            labels,
            vec![
                "chips/shelf/mt",
                "chips/shelf/gt",
                "drinks/shelf/mt",
                "drinks/shelf/gt"
            ]
        );
    }

    #[test]
    fn stats_skip_empty_combinations_and_count_unique_stores() {
        let combos = query().combinations();
        let batches = vec![
            CombinationBatch {
                combination: combos[0].clone(),
                sessions: vec![session("s1", "a", 4), session("s2", "a", 2), session("s3", "b", 6)],
            },
            CombinationBatch {
                combination: combos[1].clone(),
                sessions: vec![],
            },
            CombinationBatch {
                combination: combos[2].clone(),
                sessions: vec![session("s4", "b", 1), session("s5", "c", 3)],
            },
        ];

        let stats = candidate_stats("acme", &batches);
        assert_eq!(stats.combinations.len(), 2);
        assert_eq!(stats.total_num_sessions, 5);
        assert_eq!(stats.total_num_images, 16);
        assert_eq!(stats.total_num_unique_stores, 4);
        // first sessions of a, b, c: 4 + 6 + 3
        assert_eq!(stats.total_num_unique_images, 13);
        assert_eq!(stats.combinations[0].average_images_per_session, 4.0);
    }
}
