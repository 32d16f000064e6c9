//! EASE: closed-form linear item-item weights (Steck's "Embarrassingly
//! Shallow Autoencoder"), solved with Cholesky and a Newton-Schulz fallback.

use async_trait::async_trait;
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::{RecommendError, Result};
use crate::math::{cholesky_inverse, newton_schulz_pinv};
use crate::types::{Interaction, Item, ItemId, UserId};

/// Iterations of the pseudo-inverse fallback.
const PINV_ITERATIONS: usize = 10;

/// EASE hyperparameters.
#[derive(Debug, Clone)]
pub struct EaseConfig {
    /// L2 regularization added to the Gram diagonal.
    pub regularization: f64,

    /// Interactions below this confidence are treated as absent.
    pub min_confidence: f64,

    /// Worker fan-out for the Gram accumulation.
    pub num_workers: usize,
}

impl Default for EaseConfig {
    fn default() -> Self {
        Self {
            regularization: 500.0,
            min_confidence: 0.1,
            num_workers: 4,
        }
    }
}

struct EaseModel {
    item_index: HashMap<ItemId, usize>,
    user_histories: HashMap<UserId, Vec<(usize, f64)>>,
    /// Item-item weight matrix B with a zeroed diagonal.
    weights: Array2<f64>,
}

/// Closed-form item-item recommender.
pub struct Ease {
    config: EaseConfig,
    state: ModelLock<EaseModel>,
}

impl Ease {
    pub fn new(config: EaseConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }
}

impl Default for Ease {
    fn default() -> Self {
        Self::new(EaseConfig::default())
    }
}

#[async_trait]
impl Algorithm for Ease {
    fn name(&self) -> &'static str {
        "ease"
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

        // Index items and collect per-user confidence rows, keeping the
        // strongest signal per (user, item).
        let mut item_index: HashMap<ItemId, usize> = HashMap::new();
        let mut rows: HashMap<UserId, HashMap<usize, f64>> = HashMap::new();
        for interaction in interactions {
            if !interaction.is_usable(self.config.min_confidence) {
                continue;
            }
            let next = item_index.len();
            let index = *item_index.entry(interaction.item_id).or_insert(next);
            let row = rows.entry(interaction.user_id).or_default();
            let slot = row.entry(index).or_insert(0.0);
            if interaction.confidence > *slot {
                *slot = interaction.confidence;
            }
        }
        let n = item_index.len();

        ensure_active(ctx)?;

        // Gram matrix G = X^T X, sharded across workers; partial sums merge
        // under a single mutex.
        let user_rows: Vec<Vec<(usize, f64)>> = rows
            .values()
            .map(|row| row.iter().map(|(&i, &c)| (i, c)).collect())
            .collect();
        let gram = Mutex::new(Array2::<f64>::zeros((n, n)));
        let workers = self.config.num_workers.max(1);
        let chunk = user_rows.len().div_ceil(workers).max(1);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| RecommendError::Numerical(e.to_string()))?;
        pool.install(|| {
            user_rows.par_chunks(chunk).for_each(|shard| {
                let mut partial = Array2::<f64>::zeros((n, n));
                for row in shard {
                    for &(i, ci) in row {
                        for &(j, cj) in row {
                            partial[[i, j]] += ci * cj;
                        }
                    }
                }
                let mut merged = gram.lock().unwrap_or_else(|e| e.into_inner());
                *merged += &partial;
            });
        });
        let gram = gram.into_inner().unwrap_or_else(|e| e.into_inner());

        ensure_active(ctx)?;

        let mut regularized = gram.clone();
        for i in 0..n {
            regularized[[i, i]] += self.config.regularization;
        }

        let inverse = match cholesky_inverse(&regularized) {
            Some(inverse) => inverse,
            None => {
                debug!("gram matrix not positive-definite, using pseudo-inverse fallback");
                newton_schulz_pinv(&regularized, PINV_ITERATIONS)
            }
        };

        let mut weights = gram.dot(&inverse);
        for i in 0..n {
            weights[[i, i]] = 0.0;
        }

        let user_histories = rows
            .into_iter()
            .map(|(user, row)| (user, row.into_iter().collect()))
            .collect();

        slot.install(EaseModel {
            item_index,
            user_histories,
            weights,
        });
        info!(items = n, "ease training finished");
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
            let Some(&col) = model.item_index.get(&candidate) else {
                continue;
            };
            if history.iter().any(|&(i, _)| i == col) {
                continue;
            }
            let score: f64 = history
                .iter()
                .map(|&(row, confidence)| confidence * model.weights[[row, col]])
                .sum();
            scores.insert(candidate, score);
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

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            if candidate == item_id {
                continue;
            }
            let Some(&other) = model.item_index.get(&candidate) else {
                continue;
            };
            let similarity =
                (model.weights[[probe, other]] + model.weights[[other, probe]]) / 2.0;
            scores.insert(candidate, similarity);
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlapping_interactions() -> Vec<Interaction> {
        // Users 1-3 share items 10/11; user 4 sticks to item 12.
        vec![
            Interaction::new(1, 10, 1.0),
            Interaction::new(1, 11, 1.0),
            Interaction::new(2, 10, 1.0),
            Interaction::new(2, 11, 1.0),
            Interaction::new(3, 10, 1.0),
            Interaction::new(4, 12, 1.0),
        ]
    }

    #[tokio::test]
    async fn test_cooccurring_item_ranks_first() {
        let ease = Ease::default();
        let ctx = CancellationToken::new();
        ease.train(&ctx, &overlapping_interactions(), &[])
            .await
            .unwrap();
        assert!(ease.is_trained().await);
        assert_eq!(ease.version().await, 1);

        // User 3 watched 10; 11 co-occurs with 10, 12 does not.
        let scores = ease.predict(&ctx, 3, &[11, 12]).await.unwrap();
        assert!(scores[&11] > scores[&12]);
        assert!(scores.values().all(|s| (0.0..=1.0).contains(s)));
    }

    #[tokio::test]
    async fn test_unknown_user_is_empty_not_error() {
        let ease = Ease::default();
        let ctx = CancellationToken::new();
        ease.train(&ctx, &overlapping_interactions(), &[])
            .await
            .unwrap();
        assert!(ease.predict(&ctx, 999, &[10]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_untrained_is_empty() {
        let ease = Ease::default();
        let ctx = CancellationToken::new();
        assert!(ease.predict(&ctx, 1, &[10]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_similar_excludes_self() {
        let ease = Ease::default();
        let ctx = CancellationToken::new();
        ease.train(&ctx, &overlapping_interactions(), &[])
            .await
            .unwrap();
        let scores = ease.predict_similar(&ctx, 10, &[10, 11, 12]).await.unwrap();
        assert!(!scores.contains_key(&10));
        assert!(scores.contains_key(&11));
    }

    #[tokio::test]
    async fn test_cancelled_training_leaves_state() {
        let ease = Ease::default();
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = ease
            .train(&ctx, &overlapping_interactions(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RecommendError::Cancelled));
        assert!(!ease.is_trained().await);
        assert_eq!(ease.version().await, 0);
    }
}
