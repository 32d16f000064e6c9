//! FPMC: factorized personalized Markov chains. Four factor matrices trained
//! with BPR-style pairwise SGD over (user, last item, next item) samples.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::Result;
use crate::math::{cosine, sigmoid};
use crate::types::{Interaction, Item, ItemId, UserId};

/// Cap on rejection-sampling attempts for one negative item.
const NEGATIVE_SAMPLE_TRIES: usize = 100;

/// FPMC hyperparameters.
#[derive(Debug, Clone)]
pub struct FpmcConfig {
    pub factors: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub regularization: f64,

    /// Negative updates per positive sample.
    pub negative_samples: usize,

    /// Sequence truncation per user, most recent kept.
    pub max_history: usize,

    pub seed: u64,
    pub min_confidence: f64,
}

impl Default for FpmcConfig {
    fn default() -> Self {
        Self {
            factors: 16,
            epochs: 30,
            learning_rate: 0.05,
            regularization: 0.01,
            negative_samples: 3,
            max_history: 50,
            seed: 42,
            min_confidence: 0.1,
        }
    }
}

struct FpmcModel {
    user_index: HashMap<UserId, usize>,
    item_index: HashMap<ItemId, usize>,
    /// V^U: user taste factors.
    user_factors: Array2<f64>,
    /// V^{I,U}: item factors interacting with user taste.
    item_user_factors: Array2<f64>,
    /// V^{I,L}: factors of the preceding item.
    last_factors: Array2<f64>,
    /// V^{I,I}: factors of the candidate next item.
    next_factors: Array2<f64>,
    user_last: HashMap<UserId, usize>,
    user_items: HashMap<UserId, HashSet<usize>>,
}

impl FpmcModel {
    fn score(&self, user: usize, last: usize, next: usize, factors: usize) -> f64 {
        let mut total = 0.0;
        for f in 0..factors {
            total += self.user_factors[[user, f]] * self.item_user_factors[[next, f]];
            total += self.last_factors[[last, f]] * self.next_factors[[next, f]];
        }
        total
    }
}

/// Sequence-aware personalized recommender.
pub struct Fpmc {
    config: FpmcConfig,
    state: ModelLock<FpmcModel>,
}

impl Fpmc {
    pub fn new(config: FpmcConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }

    fn init_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f64> {
        let mut matrix = Array2::<f64>::zeros((rows, cols));
        for r in 0..rows {
            for c in 0..cols {
                matrix[[r, c]] = rng.gen_range(-0.01..0.01);
            }
        }
        matrix
    }
}

impl Default for Fpmc {
    fn default() -> Self {
        Self::new(FpmcConfig::default())
    }
}

#[async_trait]
impl Algorithm for Fpmc {
    fn name(&self) -> &'static str {
        "fpmc"
    }

    async fn is_trained(&self) -> bool {
        self.state.is_trained().await
    }

    async fn version(&self) -> u64 {
        self.state.version().await
    }

    async fn last_trained_at(&self) -> Option<DateTime<Utc>> {
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

        // Time-ordered sequences per user, truncated to the most recent
        // max_history events.
        let mut user_index: HashMap<UserId, usize> = HashMap::new();
        let mut item_index: HashMap<ItemId, usize> = HashMap::new();
        let mut sequences: HashMap<UserId, Vec<(Option<DateTime<Utc>>, usize)>> = HashMap::new();
        for interaction in interactions {
            if !interaction.is_usable(self.config.min_confidence) {
                continue;
            }
            let next_user = user_index.len();
            user_index.entry(interaction.user_id).or_insert(next_user);
            let next_item = item_index.len();
            let item = *item_index.entry(interaction.item_id).or_insert(next_item);
            sequences
                .entry(interaction.user_id)
                .or_default()
                .push((interaction.timestamp, item));
        }

        let n_users = user_index.len();
        let n_items = item_index.len();
        let k = self.config.factors;

        let mut samples: Vec<(usize, usize, usize)> = Vec::new();
        let mut user_last: HashMap<UserId, usize> = HashMap::new();
        let mut user_items: HashMap<UserId, HashSet<usize>> = HashMap::new();
        // Stable user order keeps the sample sequence, and therefore the RNG
        // stream, reproducible across retrains.
        let mut users: Vec<UserId> = sequences.keys().copied().collect();
        users.sort_unstable();
        for user in users {
            let Some(sequence) = sequences.get_mut(&user) else {
                continue;
            };
            sequence.sort_by_key(|&(ts, _)| ts);
            if sequence.len() > self.config.max_history {
                let excess = sequence.len() - self.config.max_history;
                sequence.drain(..excess);
            }
            let u = user_index[&user];
            for pair in sequence.windows(2) {
                samples.push((u, pair[0].1, pair[1].1));
            }
            if let Some(&(_, last)) = sequence.last() {
                user_last.insert(user, last);
            }
            user_items.insert(user, sequence.iter().map(|&(_, i)| i).collect());
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut model = FpmcModel {
            user_index,
            item_index,
            user_factors: Self::init_matrix(&mut rng, n_users, k),
            item_user_factors: Self::init_matrix(&mut rng, n_items, k),
            last_factors: Self::init_matrix(&mut rng, n_items, k),
            next_factors: Self::init_matrix(&mut rng, n_items, k),
            user_last,
            user_items,
        };

        let lr = self.config.learning_rate;
        let reg = self.config.regularization;
        let mut consumed_by_index: Vec<HashSet<usize>> = vec![HashSet::new(); n_users];
        for (user, items) in &model.user_items {
            consumed_by_index[model.user_index[user]] = items.clone();
        }

        for epoch in 0..self.config.epochs {
            ensure_active(ctx)?;
            for &(u, last, positive) in &samples {
                for _ in 0..self.config.negative_samples.max(1) {
                    let negative = {
                        let mut drawn = None;
                        for _ in 0..NEGATIVE_SAMPLE_TRIES {
                            let j = rng.gen_range(0..n_items.max(1));
                            if !consumed_by_index[u].contains(&j) {
                                drawn = Some(j);
                                break;
                            }
                        }
                        match drawn {
                            Some(j) => j,
                            None => continue,
                        }
                    };

                    let x = model.score(u, last, positive, k)
                        - model.score(u, last, negative, k);
                    let g = sigmoid(-x);

                    for f in 0..k {
                        let vu = model.user_factors[[u, f]];
                        let viu_pos = model.item_user_factors[[positive, f]];
                        let viu_neg = model.item_user_factors[[negative, f]];
                        let vl = model.last_factors[[last, f]];
                        let vii_pos = model.next_factors[[positive, f]];
                        let vii_neg = model.next_factors[[negative, f]];

                        model.user_factors[[u, f]] += lr * (g * (viu_pos - viu_neg) - reg * vu);
                        model.item_user_factors[[positive, f]] +=
                            lr * (g * vu - reg * viu_pos);
                        model.item_user_factors[[negative, f]] +=
                            lr * (-g * vu - reg * viu_neg);
                        model.last_factors[[last, f]] += lr * (g * (vii_pos - vii_neg) - reg * vl);
                        model.next_factors[[positive, f]] += lr * (g * vl - reg * vii_pos);
                        model.next_factors[[negative, f]] += lr * (-g * vl - reg * vii_neg);
                    }
                }
            }
            tracing::debug!(epoch, "fpmc epoch finished");
        }

        info!(
            users = n_users,
            items = n_items,
            samples = samples.len(),
            "fpmc training finished"
        );
        slot.install(model);
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
        let (Some(&u), Some(&last)) = (
            model.user_index.get(&user_id),
            model.user_last.get(&user_id),
        ) else {
            return Ok(ScoreMap::new());
        };
        let consumed = model.user_items.get(&user_id);

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            let Some(&i) = model.item_index.get(&candidate) else {
                continue;
            };
            if consumed.map_or(false, |seen| seen.contains(&i)) {
                continue;
            }
            scores.insert(candidate, model.score(u, last, i, self.config.factors));
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
        let Some(&probe) = model.item_index.get(&item_id) else {
            return Ok(ScoreMap::new());
        };

        let k = self.config.factors;
        let probe_row: Vec<f64> = (0..k).map(|f| model.next_factors[[probe, f]]).collect();
        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            if candidate == item_id {
                continue;
            }
            let Some(&other) = model.item_index.get(&candidate) else {
                continue;
            };
            let other_row: Vec<f64> = (0..k).map(|f| model.next_factors[[other, f]]).collect();
            scores.insert(candidate, cosine(&probe_row, &other_row));
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// Two stable watch orders: 10 -> 11 -> 12 and 20 -> 21.
    fn sequence_interactions() -> Vec<Interaction> {
        let t0 = Utc::now() - Duration::days(2);
        let mut out = Vec::new();
        for user in 1..=4 {
            out.push(Interaction::at(user, 10, 0.9, t0));
            out.push(Interaction::at(user, 11, 0.9, t0 + Duration::hours(1)));
            out.push(Interaction::at(user, 12, 0.9, t0 + Duration::hours(2)));
        }
        for user in 5..=6 {
            out.push(Interaction::at(user, 20, 0.9, t0));
            out.push(Interaction::at(user, 21, 0.9, t0 + Duration::hours(1)));
        }
        out
    }

    fn small_fpmc() -> Fpmc {
        Fpmc::new(FpmcConfig {
            factors: 8,
            epochs: 60,
            ..FpmcConfig::default()
        })
    }

    #[tokio::test]
    async fn test_sequence_follower_outranks_stranger() {
        let fpmc = small_fpmc();
        let ctx = CancellationToken::new();
        let mut interactions = sequence_interactions();
        // User 7 watched 10 then 11; 12 should follow, 21 should not.
        let t0 = Utc::now() - Duration::days(1);
        interactions.push(Interaction::at(7, 10, 0.9, t0));
        interactions.push(Interaction::at(7, 11, 0.9, t0 + Duration::hours(1)));
        fpmc.train(&ctx, &interactions, &[]).await.unwrap();

        let scores = fpmc.predict(&ctx, 7, &[12, 21]).await.unwrap();
        assert!(scores[&12] > scores[&21]);
    }

    #[tokio::test]
    async fn test_consumed_items_excluded() {
        let fpmc = small_fpmc();
        let ctx = CancellationToken::new();
        fpmc.train(&ctx, &sequence_interactions(), &[])
            .await
            .unwrap();
        let scores = fpmc.predict(&ctx, 1, &[10, 11]).await.unwrap();
        assert!(scores.is_empty());
    }

    #[tokio::test]
    async fn test_seeded_training_reproduces() {
        let ctx = CancellationToken::new();
        let interactions = sequence_interactions();
        let a = small_fpmc();
        a.train(&ctx, &interactions, &[]).await.unwrap();
        let b = small_fpmc();
        b.train(&ctx, &interactions, &[]).await.unwrap();

        let pa = a.predict(&ctx, 5, &[10, 11, 12]).await.unwrap();
        let pb = b.predict(&ctx, 5, &[10, 11, 12]).await.unwrap();
        assert_eq!(pa, pb);
    }

    #[tokio::test]
    async fn test_similar_uses_next_factors() {
        let fpmc = small_fpmc();
        let ctx = CancellationToken::new();
        fpmc.train(&ctx, &sequence_interactions(), &[])
            .await
            .unwrap();
        let scores = fpmc.predict_similar(&ctx, 11, &[11, 12, 21]).await.unwrap();
        assert!(!scores.contains_key(&11));
        assert_eq!(scores.len(), 2);
    }
}
