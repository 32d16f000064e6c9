//! BPR: Bayesian personalized ranking matrix factorization trained with
//! pairwise SGD over sampled (positive, negative) item pairs.

use async_trait::async_trait;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
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

/// Learning-rate decay applied every ten epochs.
const LR_DECAY: f64 = 0.95;

/// BPR hyperparameters.
#[derive(Debug, Clone)]
pub struct BprConfig {
    pub factors: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub regularization: f64,
    pub seed: u64,
    pub min_confidence: f64,
}

impl Default for BprConfig {
    fn default() -> Self {
        Self {
            factors: 32,
            epochs: 50,
            learning_rate: 0.05,
            regularization: 0.01,
            seed: 42,
            min_confidence: 0.1,
        }
    }
}

struct BprModel {
    user_index: HashMap<UserId, usize>,
    item_index: HashMap<ItemId, usize>,
    user_factors: Array2<f64>,
    item_factors: Array2<f64>,
    user_items: HashMap<UserId, HashSet<usize>>,
}

/// Pairwise-ranking matrix factorization.
pub struct Bpr {
    config: BprConfig,
    state: ModelLock<BprModel>,
}

impl Bpr {
    pub fn new(config: BprConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }

    fn init_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f64> {
        let mut matrix = Array2::<f64>::zeros((rows, cols));
        for r in 0..rows {
            for c in 0..cols {
                matrix[[r, c]] = rng.gen_range(-0.05..0.05);
            }
        }
        matrix
    }

    fn dot(u: &Array2<f64>, a: usize, v: &Array2<f64>, b: usize, k: usize) -> f64 {
        (0..k).map(|f| u[[a, f]] * v[[b, f]]).sum()
    }
}

impl Default for Bpr {
    fn default() -> Self {
        Self::new(BprConfig::default())
    }
}

#[async_trait]
impl Algorithm for Bpr {
    fn name(&self) -> &'static str {
        "bpr"
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

        let mut user_index: HashMap<UserId, usize> = HashMap::new();
        let mut item_index: HashMap<ItemId, usize> = HashMap::new();
        let mut positives: Vec<(usize, usize)> = Vec::new();
        let mut user_items: HashMap<UserId, HashSet<usize>> = HashMap::new();
        for interaction in interactions {
            if !interaction.is_usable(self.config.min_confidence) {
                continue;
            }
            let next_user = user_index.len();
            let u = *user_index.entry(interaction.user_id).or_insert(next_user);
            let next_item = item_index.len();
            let i = *item_index.entry(interaction.item_id).or_insert(next_item);
            if user_items
                .entry(interaction.user_id)
                .or_default()
                .insert(i)
            {
                positives.push((u, i));
            }
        }

        let n_users = user_index.len();
        let n_items = item_index.len();
        let k = self.config.factors;

        let mut consumed_by_index: Vec<HashSet<usize>> = vec![HashSet::new(); n_users];
        for (user, items) in &user_items {
            consumed_by_index[user_index[user]] = items.clone();
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut user_factors = Self::init_matrix(&mut rng, n_users, k);
        let mut item_factors = Self::init_matrix(&mut rng, n_items, k);

        let reg = self.config.regularization;
        let mut lr = self.config.learning_rate;
        for epoch in 0..self.config.epochs {
            ensure_active(ctx)?;
            if epoch > 0 && epoch % 10 == 0 {
                lr *= LR_DECAY;
            }

            positives.shuffle(&mut rng);
            for &(u, i) in &positives {
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

                let x_uij = Self::dot(&user_factors, u, &item_factors, i, k)
                    - Self::dot(&user_factors, u, &item_factors, negative, k);
                let sigma = sigmoid(-x_uij);

                for f in 0..k {
                    let w = user_factors[[u, f]];
                    let h_pos = item_factors[[i, f]];
                    let h_neg = item_factors[[negative, f]];

                    user_factors[[u, f]] += lr * (sigma * (h_pos - h_neg) - reg * w);
                    item_factors[[i, f]] += lr * (sigma * w - reg * h_pos);
                    item_factors[[negative, f]] += lr * (-sigma * w - reg * h_neg);
                }
            }
            tracing::debug!(epoch, lr, "bpr epoch finished");
        }

        info!(
            users = n_users,
            items = n_items,
            positives = positives.len(),
            "bpr training finished"
        );
        slot.install(BprModel {
            user_index,
            item_index,
            user_factors,
            item_factors,
            user_items,
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
        let Some(&u) = model.user_index.get(&user_id) else {
            return Ok(ScoreMap::new());
        };
        let consumed = model.user_items.get(&user_id);
        let k = self.config.factors;

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            let Some(&i) = model.item_index.get(&candidate) else {
                continue;
            };
            if consumed.map_or(false, |seen| seen.contains(&i)) {
                continue;
            }
            scores.insert(
                candidate,
                Self::dot(&model.user_factors, u, &model.item_factors, i, k),
            );
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

        let probe_row: Vec<f64> = (0..k).map(|f| model.item_factors[[probe, f]]).collect();
        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            if candidate == item_id {
                continue;
            }
            let Some(&other) = model.item_index.get(&candidate) else {
                continue;
            };
            let other_row: Vec<f64> = (0..k).map(|f| model.item_factors[[other, f]]).collect();
            scores.insert(candidate, cosine(&probe_row, &other_row));
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cluster_interactions() -> Vec<Interaction> {
        let mut out = Vec::new();
        for user in 1..=4 {
            out.push(Interaction::new(user, 10, 0.9));
            out.push(Interaction::new(user, 11, 0.9));
            out.push(Interaction::new(user, 12, 0.9));
        }
        for user in 5..=8 {
            out.push(Interaction::new(user, 20, 0.9));
            out.push(Interaction::new(user, 21, 0.9));
        }
        // User 9 spans into cluster A without item 12.
        out.push(Interaction::new(9, 10, 0.9));
        out.push(Interaction::new(9, 11, 0.9));
        out
    }

    fn small_bpr() -> Bpr {
        Bpr::new(BprConfig {
            factors: 8,
            epochs: 80,
            ..BprConfig::default()
        })
    }

    #[tokio::test]
    async fn test_cluster_item_outranks_foreign() {
        let bpr = small_bpr();
        let ctx = CancellationToken::new();
        bpr.train(&ctx, &two_cluster_interactions(), &[])
            .await
            .unwrap();

        let scores = bpr.predict(&ctx, 9, &[12, 20]).await.unwrap();
        assert!(scores[&12] > scores[&20]);
    }

    #[tokio::test]
    async fn test_seeded_retrain_is_stable_within_tolerance() {
        let ctx = CancellationToken::new();
        let interactions = two_cluster_interactions();

        let first = small_bpr();
        first.train(&ctx, &interactions, &[]).await.unwrap();
        let second = small_bpr();
        second.train(&ctx, &interactions, &[]).await.unwrap();

        // Same seed, same data: scores agree within a 5% band.
        let a = bpr_scores(&first, &ctx).await;
        let b = bpr_scores(&second, &ctx).await;
        for (key, value) in &a {
            let other = b[key];
            assert!((value - other).abs() <= 0.05, "{}: {} vs {}", key, value, other);
        }
    }

    async fn bpr_scores(bpr: &Bpr, ctx: &CancellationToken) -> ScoreMap {
        bpr.predict(ctx, 9, &[12, 20, 21]).await.unwrap()
    }

    #[tokio::test]
    async fn test_consumed_items_excluded() {
        let bpr = small_bpr();
        let ctx = CancellationToken::new();
        bpr.train(&ctx, &two_cluster_interactions(), &[])
            .await
            .unwrap();
        let scores = bpr.predict(&ctx, 1, &[10, 11, 12]).await.unwrap();
        assert!(scores.is_empty());
    }

    #[tokio::test]
    async fn test_similar_items_cluster_together() {
        let bpr = small_bpr();
        let ctx = CancellationToken::new();
        bpr.train(&ctx, &two_cluster_interactions(), &[])
            .await
            .unwrap();
        let scores = bpr.predict_similar(&ctx, 10, &[11, 20]).await.unwrap();
        assert!(scores[&11] > scores[&20]);
    }
}
