//! Co-visitation: session-scoped co-occurrence counting converted into a
//! Jaccard-like item similarity table.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::Result;
use crate::types::{Interaction, Item, ItemId, UserId};

/// Co-visitation hyperparameters.
#[derive(Debug, Clone)]
pub struct CovisitationConfig {
    /// Gap that closes a session.
    pub session_window_hours: u32,

    /// Pairs seen fewer times than this are dropped.
    pub min_co_occurrence: u32,

    /// Cap on retained pairs, strongest first.
    pub max_pairs: usize,

    pub min_confidence: f64,
}

impl Default for CovisitationConfig {
    fn default() -> Self {
        Self {
            session_window_hours: 24,
            min_co_occurrence: 2,
            max_pairs: 100_000,
            min_confidence: 0.1,
        }
    }
}

struct CovisitationModel {
    similarities: HashMap<ItemId, Vec<(ItemId, f64)>>,
    user_histories: HashMap<UserId, Vec<ItemId>>,
}

/// Session co-occurrence recommender.
pub struct Covisitation {
    config: CovisitationConfig,
    state: ModelLock<CovisitationModel>,
}

impl Covisitation {
    pub fn new(config: CovisitationConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }

    /// Split one user's time-ordered interactions into sessions.
    fn sessions(&self, ordered: &[(DateTime<Utc>, ItemId)]) -> Vec<Vec<ItemId>> {
        let window = Duration::hours(i64::from(self.config.session_window_hours));
        let mut sessions = Vec::new();
        let mut current: Vec<ItemId> = Vec::new();
        let mut previous: Option<DateTime<Utc>> = None;

        for &(ts, item) in ordered {
            if let Some(prev) = previous {
                if ts - prev > window && !current.is_empty() {
                    sessions.push(std::mem::take(&mut current));
                }
            }
            current.push(item);
            previous = Some(ts);
        }
        if !current.is_empty() {
            sessions.push(current);
        }
        sessions
    }
}

impl Default for Covisitation {
    fn default() -> Self {
        Self::new(CovisitationConfig::default())
    }
}

#[async_trait]
impl Algorithm for Covisitation {
    fn name(&self) -> &'static str {
        "covisitation"
    }

    async fn is_trained(&self) -> bool {
        self.state.is_trained().await
    }

    async fn version(&self) -> u64 {
        self.state.version().await
    }

    async fn last_trained_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.state.last_trained_at().await
    }

    async fn train(
        &self,
        ctx: &CancellationToken,
        interactions: &[Interaction],
        _items: &[Item],
    ) -> Result<()> {
        let mut slot = self.state.write().await;
        ensure_active(ctx)?;

        // Time-ordered interactions per user. Untimestamped events sort to
        // the epoch and land in the first session.
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let mut by_user: HashMap<UserId, Vec<(DateTime<Utc>, ItemId)>> = HashMap::new();
        let mut histories: HashMap<UserId, Vec<ItemId>> = HashMap::new();
        for interaction in interactions {
            if !interaction.is_usable(self.config.min_confidence) {
                continue;
            }
            by_user
                .entry(interaction.user_id)
                .or_default()
                .push((interaction.timestamp.unwrap_or(epoch), interaction.item_id));
            let history = histories.entry(interaction.user_id).or_default();
            if !history.contains(&interaction.item_id) {
                history.push(interaction.item_id);
            }
        }

        ensure_active(ctx)?;

        let mut pair_counts: HashMap<(ItemId, ItemId), u32> = HashMap::new();
        let mut occurrence: HashMap<ItemId, u32> = HashMap::new();
        for ordered in by_user.values_mut() {
            ordered.sort_by_key(|&(ts, _)| ts);
            for session in self.sessions(ordered) {
                let unique: Vec<ItemId> = {
                    let mut seen = HashSet::new();
                    session
                        .into_iter()
                        .filter(|item| seen.insert(*item))
                        .collect()
                };
                for &item in &unique {
                    *occurrence.entry(item).or_insert(0) += 1;
                }
                for a in 0..unique.len() {
                    for b in a + 1..unique.len() {
                        let key = if unique[a] < unique[b] {
                            (unique[a], unique[b])
                        } else {
                            (unique[b], unique[a])
                        };
                        *pair_counts.entry(key).or_insert(0) += 1;
                    }
                }
            }
        }

        ensure_active(ctx)?;

        // Strongest pairs first, capped, then converted to a Jaccard-like
        // similarity.
        let mut pairs: Vec<((ItemId, ItemId), u32)> = pair_counts
            .into_iter()
            .filter(|&(_, count)| count >= self.config.min_co_occurrence)
            .collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        pairs.truncate(self.config.max_pairs);

        let mut similarities: HashMap<ItemId, Vec<(ItemId, f64)>> = HashMap::new();
        for ((a, b), count) in pairs {
            let n_a = occurrence.get(&a).copied().unwrap_or(count);
            let n_b = occurrence.get(&b).copied().unwrap_or(count);
            let union = n_a + n_b - count;
            if union == 0 {
                continue;
            }
            let similarity = f64::from(count) / f64::from(union);
            similarities.entry(a).or_default().push((b, similarity));
            similarities.entry(b).or_default().push((a, similarity));
        }

        info!(
            items = similarities.len(),
            "co-visitation training finished"
        );
        slot.install(CovisitationModel {
            similarities,
            user_histories: histories,
        });
        Ok(())
    }

    async fn predict(
        &self,
        ctx: &CancellationToken,
        user_id: UserId,
        candidates: &[ItemId],
    ) -> Result<ScoreMap> {
        ensure_active(ctx)?;
        let slot = self.state.read().await;
        let Some(model) = slot.model.as_ref() else {
            return Ok(ScoreMap::new());
        };
        let Some(history) = model.user_histories.get(&user_id) else {
            return Ok(ScoreMap::new());
        };

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            let mut total = 0.0;
            for &watched in history {
                if watched == candidate {
                    continue;
                }
                if let Some(neighbors) = model.similarities.get(&watched) {
                    if let Some(&(_, similarity)) =
                        neighbors.iter().find(|&&(item, _)| item == candidate)
                    {
                        total += similarity;
                    }
                }
            }
            if total > 0.0 {
                scores.insert(candidate, total);
            }
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }

    async fn predict_similar(
        &self,
        ctx: &CancellationToken,
        item_id: ItemId,
        candidates: &[ItemId],
    ) -> Result<ScoreMap> {
        ensure_active(ctx)?;
        let slot = self.state.read().await;
        let Some(model) = slot.model.as_ref() else {
            return Ok(ScoreMap::new());
        };
        let Some(neighbors) = model.similarities.get(&item_id) else {
            return Ok(ScoreMap::new());
        };

        let mut scores = ScoreMap::new();
        for &(item, similarity) in neighbors {
            if item != item_id && candidates.contains(&item) {
                scores.insert(item, similarity);
            }
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}
