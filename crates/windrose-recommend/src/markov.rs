//! First-order Markov chain over within-session item transitions, with
//! Laplace smoothing. The model is global, not personalized.

use async_trait::async_trait;
use chrono::Duration;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::Result;
use crate::types::{Interaction, Item, ItemId, UserId};

/// Markov chain hyperparameters.
#[derive(Debug, Clone)]
pub struct MarkovConfig {
    /// Two events further apart than this never form a transition.
    pub session_window_seconds: i64,

    /// Transitions observed fewer times than this are dropped.
    pub min_transition_count: u32,

    /// Laplace smoothing strength.
    pub smoothing: f64,

    /// Outgoing transitions retained per source item.
    pub max_transitions_per_item: usize,

    pub min_confidence: f64,
}

impl Default for MarkovConfig {
    fn default() -> Self {
        Self {
            session_window_seconds: 3600,
            min_transition_count: 2,
            smoothing: 1.0,
            max_transitions_per_item: 50,
            min_confidence: 0.1,
        }
    }
}

struct MarkovModel {
    /// source -> [(target, smoothed probability)], strongest first.
    transitions: HashMap<ItemId, Vec<(ItemId, f64)>>,
}

/// Global next-item model.
pub struct MarkovChain {
    config: MarkovConfig,
    state: ModelLock<MarkovModel>,
}

impl MarkovChain {
    pub fn new(config: MarkovConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }

    /// Transition probabilities out of `item`, restricted to `candidates`
    /// and renormalized over what remains.
    pub async fn predict_next(&self, item_id: ItemId, candidates: &[ItemId]) -> ScoreMap {
        let slot = self.state.read().await;
        let Some(model) = slot.model.as_ref() else {
            return ScoreMap::new();
        };
        let Some(outgoing) = model.transitions.get(&item_id) else {
            return ScoreMap::new();
        };

        let mut restricted = ScoreMap::new();
        for &(target, probability) in outgoing {
            if candidates.contains(&target) {
                restricted.insert(target, probability);
            }
        }
        let total: f64 = restricted.values().sum();
        if total > 0.0 {
            for probability in restricted.values_mut() {
                *probability /= total;
            }
        }
        restricted
    }
}

impl Default for MarkovChain {
    fn default() -> Self {
        Self::new(MarkovConfig::default())
    }
}

#[async_trait]
impl Algorithm for MarkovChain {
    fn name(&self) -> &'static str {
        "markov_chain"
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

        // Transitions need timestamps; undated events cannot be ordered.
        let mut ordered: Vec<&Interaction> = interactions
            .iter()
            .filter(|i| i.is_usable(self.config.min_confidence) && i.timestamp.is_some())
            .collect();
        ordered.sort_by_key(|i| (i.user_id, i.timestamp));

        let window = Duration::seconds(self.config.session_window_seconds);
        let vocabulary: HashSet<ItemId> = ordered.iter().map(|i| i.item_id).collect();
        let v = vocabulary.len() as f64;

        ensure_active(ctx)?;

        let mut counts: HashMap<ItemId, HashMap<ItemId, u32>> = HashMap::new();
        let mut totals: HashMap<ItemId, u32> = HashMap::new();
        for pair in ordered.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if from.user_id != to.user_id {
                continue;
            }
            let (Some(t_from), Some(t_to)) = (from.timestamp, to.timestamp) else {
                continue;
            };
            if t_to - t_from > window {
                continue;
            }
            *counts
                .entry(from.item_id)
                .or_default()
                .entry(to.item_id)
                .or_insert(0) += 1;
            *totals.entry(from.item_id).or_insert(0) += 1;
        }

        ensure_active(ctx)?;

        let alpha = self.config.smoothing;
        let mut transitions: HashMap<ItemId, Vec<(ItemId, f64)>> = HashMap::new();
        for (source, outgoing) in counts {
            let total = f64::from(totals.get(&source).copied().unwrap_or(0));
            let mut scored: Vec<(ItemId, f64)> = outgoing
                .into_iter()
                .filter(|&(_, count)| count >= self.config.min_transition_count)
                .map(|(target, count)| {
                    let probability = (f64::from(count) + alpha) / (total + alpha * v);
                    (target, probability)
                })
                .collect();
            if scored.is_empty() {
                continue;
            }
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(self.config.max_transitions_per_item);
            transitions.insert(source, scored);
        }

        info!(sources = transitions.len(), "markov training finished");
        slot.install(MarkovModel { transitions });
        Ok(())
    }

    /// The chain has no per-user state; personalized prediction is not
    /// meaningful and always returns an empty map.
    async fn predict(
        &self,
        ctx: &CancellationToken,
        _user_id: UserId,
        _candidates: &[ItemId],
    ) -> Result<ScoreMap> {
        ensure_active(ctx)?;
        Ok(ScoreMap::new())
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
        let Some(outgoing) = model.transitions.get(&item_id) else {
            return Ok(ScoreMap::new());
        };

        let mut scores = ScoreMap::new();
        for &(target, probability) in outgoing {
            if target != item_id && candidates.contains(&target) {
                scores.insert(target, probability);
            }
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session_break_interactions() -> Vec<Interaction> {
        let t0 = Utc::now() - Duration::days(1);
        let mut out = Vec::new();
        for user in [1, 2] {
            out.push(Interaction::at(user, 100, 1.0, t0));
            out.push(Interaction::at(user, 101, 1.0, t0 + Duration::minutes(30)));
            out.push(Interaction::at(user, 102, 1.0, t0 + Duration::hours(3)));
        }
        out
    }

    #[tokio::test]
    async fn test_transition_within_window_only() {
        let chain = MarkovChain::default();
        let ctx = CancellationToken::new();
        chain
            .train(&ctx, &session_break_interactions(), &[])
            .await
            .unwrap();

        // 100 -> 101 happened twice inside the hour window.
        let next = chain.predict_next(100, &[101, 102]).await;
        assert!(next.contains_key(&101));
        assert!(!next.contains_key(&102));

        // 101 -> 102 spans 2.5 hours, beyond the window.
        let next = chain.predict_next(101, &[102]).await;
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn test_min_transition_count_gate() {
        let t0 = Utc::now() - Duration::days(1);
        let chain = MarkovChain::default();
        let ctx = CancellationToken::new();

        // A single observation of 200 -> 201 stays below the default floor
        // of two.
        let interactions = vec![
            Interaction::at(9, 200, 1.0, t0),
            Interaction::at(9, 201, 1.0, t0 + Duration::minutes(5)),
        ];
        chain.train(&ctx, &interactions, &[]).await.unwrap();
        assert!(chain.predict_next(200, &[201]).await.is_empty());
    }

    #[tokio::test]
    async fn test_cross_user_pairs_never_transition() {
        let t0 = Utc::now() - Duration::days(1);
        let chain = MarkovChain::new(MarkovConfig {
            min_transition_count: 1,
            ..MarkovConfig::default()
        });
        let ctx = CancellationToken::new();

        let interactions = vec![
            Interaction::at(1, 300, 1.0, t0),
            Interaction::at(2, 301, 1.0, t0 + Duration::minutes(1)),
        ];
        chain.train(&ctx, &interactions, &[]).await.unwrap();
        assert!(chain.predict_next(300, &[301]).await.is_empty());
    }

    #[tokio::test]
    async fn test_predict_is_not_personalized() {
        let chain = MarkovChain::default();
        let ctx = CancellationToken::new();
        chain
            .train(&ctx, &session_break_interactions(), &[])
            .await
            .unwrap();
        assert!(chain.predict(&ctx, 1, &[101]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restricted_probabilities_renormalize() {
        let t0 = Utc::now() - Duration::days(1);
        let chain = MarkovChain::new(MarkovConfig {
            min_transition_count: 1,
            ..MarkovConfig::default()
        });
        let ctx = CancellationToken::new();

        // 400 -> 401 twice, 400 -> 402 once.
        let interactions = vec![
            Interaction::at(1, 400, 1.0, t0),
            Interaction::at(1, 401, 1.0, t0 + Duration::minutes(1)),
            Interaction::at(2, 400, 1.0, t0),
            Interaction::at(2, 401, 1.0, t0 + Duration::minutes(1)),
            Interaction::at(3, 400, 1.0, t0),
            Interaction::at(3, 402, 1.0, t0 + Duration::minutes(1)),
        ];
        chain.train(&ctx, &interactions, &[]).await.unwrap();

        let next = chain.predict_next(400, &[401, 402]).await;
        let total: f64 = next.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(next[&401] > next[&402]);
    }
}
