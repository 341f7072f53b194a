//! Candidate deduplication and store-diverse sampling.
//!
//! The sampler reduces the candidate list to roughly `budget` images per
//! group. Groups whose total fits the budget are kept whole. Larger groups
//! are drawn round-robin across stores in discovery order, so no store
//! gives a second session before every store in the group has given one.
//!
//! The draw stops as soon as the running image count exceeds the budget,
//! which can be mid-round, or at the end of a round once the count has
//! reached the budget. The last session taken may therefore overshoot;
//! the sample is never truncated back under the budget.
//!
//! Everything here is pure: the same candidates in the same order with the
//! same budget always yield the same sample in the same order.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};

use crate::models::Session;

/// How candidates are partitioned before the per-group budget applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One group per `category_name`.
    #[default]
    Category,
    /// One group per (`category_name`, `store_channel_id`) pair.
    StoreChannel,
}

impl GroupBy {
    fn key(self, session: &Session) -> (String, Option<String>) {
        match self {
            GroupBy::Category => (session.category_name.clone(), None),
            GroupBy::StoreChannel => (
                session.category_name.clone(),
                Some(session.store_channel_id.clone()),
            ),
        }
    }
}

/// Drop repeated session ids, keeping the first occurrence of each.
pub fn dedup_sessions(sessions: Vec<Session>) -> Vec<Session> {
    let mut seen = HashSet::new();
    sessions
        .into_iter()
        .filter(|s| seen.insert(s.session_id.clone()))
        .collect()
}

/// Sample every group independently under `budget` images.
///
/// Groups appear in the output in the order their first session appeared
/// in `sessions`.
pub fn sample_sessions(sessions: &[Session], budget: u64, group_by: GroupBy) -> Vec<Session> {
    let mut order: Vec<(String, Option<String>)> = Vec::new();
    let mut groups: HashMap<(String, Option<String>), Vec<&Session>> = HashMap::new();

    for session in sessions {
        let key = group_by.key(session);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(session);
    }

    let mut sampled = Vec::new();
    for key in &order {
        if let Some(group) = groups.get(key) {
            sampled.extend(round_robin_by_store(group, budget).into_iter().cloned());
        }
    }
    sampled
}

/// Sample one group round-robin across its stores.
pub fn round_robin_by_store<'a>(group: &[&'a Session], budget: u64) -> Vec<&'a Session> {
    let total: u64 = group.iter().map(|s| s.num_images).sum();
    if total <= budget {
        return group.to_vec();
    }

    // Stores in discovery order, each with its sessions in list order.
    let mut store_order: Vec<&str> = Vec::new();
    let mut by_store: HashMap<&str, Vec<&'a Session>> = HashMap::new();
    for session in group {
        by_store
            .entry(session.store_id.as_str())
            .or_insert_with(|| {
                store_order.push(session.store_id.as_str());
                Vec::new()
            })
            .push(*session);
    }

    let mut picked = Vec::new();
    let mut images = 0u64;
    let mut round = 0usize;

    'rounds: while images < budget {
        let mut took_any = false;
        for store in &store_order {
            let Some(session) = by_store.get(store).and_then(|list| list.get(round)) else {
                continue;
            };
            took_any = true;
            images += session.num_images;
            picked.push(*session);
            if images > budget {
                break 'rounds;
            }
        }
        if !took_any {
            break;
        }
        round += 1;
    }

    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, store: &str, category: &str, images: u64) -> Session {
        Session {
            session_id: id.to_string(),
            store_id: store.to_string(),
            store_channel_id: format!("ch-{}", store),
            category_name: category.to_string(),
            num_images: images,
        }
    }

    fn ids(sessions: &[Session]) -> Vec<&str> {
        sessions.iter().map(|s| s.session_id.as_str()).collect()
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let input = vec![
            session("s1", "a", "chips", 1),
            session("s2", "b", "chips", 1),
            session("s1", "c", "drinks", 9),
            session("s3", "a", "chips", 1),
            session("s2", "a", "chips", 1),
        ];
        let out = dedup_sessions(input);
        assert_eq!(ids(&out), vec!["s1", "s2", "s3"]);
        assert_eq!(out[0].store_id, "a");
    }

    #[test]
    fn group_within_budget_is_kept_whole() {
        let input = vec![
            session("s1", "a", "chips", 3),
            session("s2", "a", "chips", 2),
            session("s3", "b", "chips", 5),
        ];
        let out = sample_sessions(&input, 10, GroupBy::Category);
        assert_eq!(out, input);
    }

    #[test]
    fn round_robin_visits_every_store_before_repeating() {
        let input = vec![
            session("a1", "a", "chips", 1),
            session("a2", "a", "chips", 1),
            session("a3", "a", "chips", 1),
            session("b1", "b", "chips", 1),
            session("c1", "c", "chips", 1),
            session("c2", "c", "chips", 1),
        ];
        let out = sample_sessions(&input, 4, GroupBy::Category);
        // round 0: a1 b1 c1 (3), round 1: a2 (4) then b exhausted, c2 (5 > 4) stops
        assert_eq!(ids(&out), vec!["a1", "b1", "c1", "a2", "c2"]);
    }

    #[test]
    fn stops_mid_round_once_budget_exceeded() {
        let input = vec![
            session("a1", "a", "chips", 1),
            session("b1", "b", "chips", 1),
            session("c1", "c", "chips", 1),
            session("a2", "a", "chips", 1),
        ];
        let out = sample_sessions(&input, 2, GroupBy::Category);
        assert_eq!(ids(&out), vec!["a1", "b1", "c1"]);
        let total: u64 = out.iter().map(|s| s.num_images).sum();
        assert!(total >= 2);
    }

    #[test]
    fn stops_at_round_end_when_budget_reached_exactly() {
        let input = vec![
            session("a1", "a", "chips", 1),
            session("a2", "a", "chips", 1),
            session("b1", "b", "chips", 1),
            session("b2", "b", "chips", 1),
        ];
        let out = sample_sessions(&input, 2, GroupBy::Category);
        assert_eq!(ids(&out), vec!["a1", "b1"]);
    }

    #[test]
    fn sampled_total_never_below_budget_for_oversized_group() {
        let input: Vec<Session> = (0..30)
            .map(|i| session(&format!("s{}", i), &format!("st{}", i % 4), "chips", (i % 5) + 1))
            .collect();
        for budget in [1, 7, 20, 50] {
            let out = sample_sessions(&input, budget, GroupBy::Category);
            let total: u64 = out.iter().map(|s| s.num_images).sum();
            assert!(total >= budget, "budget {} got {}", budget, total);
        }
    }

    #[test]
    fn groups_are_budgeted_independently() {
        let input = vec![
            session("c1", "a", "chips", 5),
            session("d1", "a", "drinks", 1),
            session("c2", "b", "chips", 5),
            session("d2", "b", "drinks", 1),
        ];
        let out = sample_sessions(&input, 4, GroupBy::Category);
        // chips: 10 > 4 → c1 alone exceeds; drinks: 2 <= 4 → whole group
        assert_eq!(ids(&out), vec!["c1", "d1", "d2"]);
    }

    #[test]
    fn store_channel_grouping_splits_a_category() {
        let mut a = session("s1", "a", "chips", 3);
        a.store_channel_id = "ch-1".into();
        let mut b = session("s2", "b", "chips", 3);
        b.store_channel_id = "ch-2".into();
        let input = vec![a, b];

        // each pair-group overshoots on its only session; the merged group stops after one
        assert_eq!(sample_sessions(&input, 2, GroupBy::StoreChannel).len(), 2);
        assert_eq!(sample_sessions(&input, 2, GroupBy::Category).len(), 1);
    }

    #[test]
    fn sampling_is_deterministic() {
        let input: Vec<Session> = (0..12)
            .map(|i| session(&format!("s{}", i), &format!("st{}", i % 3), "chips", 2))
            .collect();
        let first = sample_sessions(&input, 9, GroupBy::Category);
        let second = sample_sessions(&input, 9, GroupBy::Category);
        assert_eq!(first, second);
    }
}
