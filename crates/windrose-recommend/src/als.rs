//! ALS for implicit feedback (Hu, Koren, Volinsky): alternating
//! confidence-weighted least squares with deterministic initialization.

use async_trait::async_trait;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::{RecommendError, Result};
use crate::math::{cholesky_decompose, cholesky_solve, cosine};
use crate::types::{Interaction, Item, ItemId, UserId};

/// ALS hyperparameters.
#[derive(Debug, Clone)]
pub struct AlsConfig {
    /// Latent factor count.
    pub factors: usize,

    /// Alternating sweeps.
    pub iterations: usize,

    /// L2 regularization.
    pub regularization: f64,

    /// Confidence scaling: c = 1 + alpha * r.
    pub alpha: f64,

    pub min_confidence: f64,
    pub num_workers: usize,
}

impl Default for AlsConfig {
    fn default() -> Self {
        Self {
            factors: 32,
            iterations: 10,
            regularization: 0.1,
            alpha: 40.0,
            min_confidence: 0.1,
            num_workers: 4,
        }
    }
}

struct AlsModel {
    user_index: HashMap<UserId, usize>,
    item_index: HashMap<ItemId, usize>,
    user_factors: Array2<f64>,
    item_factors: Array2<f64>,
    user_items: HashMap<UserId, Vec<usize>>,
}

/// Implicit-feedback matrix factorization.
pub struct Als {
    config: AlsConfig,
    state: ModelLock<AlsModel>,
}

impl Als {
    pub fn new(config: AlsConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }

    /// Deterministic positional initialization: no RNG, identical factors on
    /// every retrain.
    fn init_factors(rows: usize, factors: usize) -> Array2<f64> {
        let mut matrix = Array2::<f64>::zeros((rows, factors));
        for r in 0..rows {
            for f in 0..factors {
                matrix[[r, f]] = 0.01 * (((r * factors + f) % 1000) as f64 / 1000.0 + 0.001);
            }
        }
        matrix
    }

    /// One half-sweep: re-solve every row of `target` holding `fixed` still.
    /// Returns the replacement matrix.
    fn solve_side(
        &self,
        observations: &[Vec<(usize, f64)>],
        fixed: &Array2<f64>,
        factors: usize,
    ) -> Result<Array2<f64>> {
        let k = factors;
        let lambda = self.config.regularization;
        let alpha = self.config.alpha;

        // Y^T Y once per sweep.
        let mut yty = Array2::<f64>::zeros((k, k));
        for row in 0..fixed.nrows() {
            for a in 0..k {
                for b in 0..k {
                    yty[[a, b]] += fixed[[row, a]] * fixed[[row, b]];
                }
            }
        }

        let solved = Mutex::new(Array2::<f64>::zeros((observations.len(), k)));
        let workers = self.config.num_workers.max(1);
        let chunk = observations.len().div_ceil(workers).max(1);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| RecommendError::Numerical(e.to_string()))?;
        let failure = Mutex::new(None::<RecommendError>);
        pool.install(|| {
            observations
                .par_chunks(chunk)
                .enumerate()
                .for_each(|(chunk_index, shard)| {
                    let base = chunk_index * chunk;
                    let mut local = Vec::with_capacity(shard.len());
                    for consumed in shard {
                        // A = Y^T Y + lambda*I + sum (c-1) y y^T; b = sum c*y.
                        let mut a = yty.clone();
                        for d in 0..k {
                            a[[d, d]] += lambda;
                        }
                        let mut b = Array1::<f64>::zeros(k);
                        for &(row, confidence) in consumed {
                            let c = 1.0 + alpha * confidence;
                            for x in 0..k {
                                let yx = fixed[[row, x]];
                                b[x] += c * yx;
                                for y in 0..k {
                                    a[[x, y]] += (c - 1.0) * yx * fixed[[row, y]];
                                }
                            }
                        }
                        match cholesky_decompose(&a) {
                            Some(l) => local.push(cholesky_solve(&l, &b)),
                            None => {
                                let mut failed =
                                    failure.lock().unwrap_or_else(|e| e.into_inner());
                                *failed = Some(RecommendError::Numerical(
                                    "normal equations not positive-definite".to_string(),
                                ));
                                local.push(Array1::zeros(k));
                            }
                        }
                    }
                    let mut merged = solved.lock().unwrap_or_else(|e| e.into_inner());
                    for (offset, x) in local.into_iter().enumerate() {
                        for f in 0..k {
                            merged[[base + offset, f]] = x[f];
                        }
                    }
                });
        });

        if let Some(err) = failure.into_inner().unwrap_or_else(|e| e.into_inner()) {
            return Err(err);
        }
        Ok(solved.into_inner().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Default for Als {
    fn default() -> Self {
        Self::new(AlsConfig::default())
    }
}

#[async_trait]
impl Algorithm for Als {
    fn name(&self) -> &'static str {
        "als"
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
        let mut by_user: Vec<Vec<(usize, f64)>> = Vec::new();
        let mut by_item: Vec<Vec<(usize, f64)>> = Vec::new();

        for interaction in interactions {
            if !interaction.is_usable(self.config.min_confidence) {
                continue;
            }
            let u = *user_index
                .entry(interaction.user_id)
                .or_insert(by_user.len());
            if u == by_user.len() {
                by_user.push(Vec::new());
            }
            let i = *item_index
                .entry(interaction.item_id)
                .or_insert(by_item.len());
            if i == by_item.len() {
                by_item.push(Vec::new());
            }
            by_user[u].push((i, interaction.confidence));
            by_item[i].push((u, interaction.confidence));
        }

        let k = self.config.factors;
        let mut user_factors = Self::init_factors(by_user.len(), k);
        let mut item_factors = Self::init_factors(by_item.len(), k);

        for sweep in 0..self.config.iterations {
            ensure_active(ctx)?;
            user_factors = self.solve_side(&by_user, &item_factors, k)?;
            ensure_active(ctx)?;
            item_factors = self.solve_side(&by_item, &user_factors, k)?;
            tracing::debug!(sweep, "als sweep finished");
        }

        let user_items = user_index
            .iter()
            .map(|(&user, &row)| (user, by_user[row].iter().map(|&(i, _)| i).collect()))
            .collect();

        info!(
            users = user_index.len(),
            items = item_index.len(),
            "als training finished"
        );
        slot.install(AlsModel {
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

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            let Some(&i) = model.item_index.get(&candidate) else {
                continue;
            };
            if consumed.map_or(false, |seen| seen.contains(&i)) {
                continue;
            }
            let score: f64 = (0..self.config.factors)
                .map(|f| model.user_factors[[u, f]] * model.item_factors[[i, f]])
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

        let probe_row: Vec<f64> = (0..self.config.factors)
            .map(|f| model.item_factors[[probe, f]])
            .collect();
        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            if candidate == item_id {
                continue;
            }
            let Some(&other) = model.item_index.get(&candidate) else {
                continue;
            };
            let other_row: Vec<f64> = (0..self.config.factors)
                .map(|f| model.item_factors[[other, f]])
                .collect();
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
        // Cluster A: users 1-3 on items 10/11. Cluster B: users 4-6 on 20/21.
        let mut out = Vec::new();
        for user in 1..=3 {
            out.push(Interaction::new(user, 10, 0.9));
            out.push(Interaction::new(user, 11, 0.9));
        }
        for user in 4..=6 {
            out.push(Interaction::new(user, 20, 0.9));
            out.push(Interaction::new(user, 21, 0.9));
        }
        out
    }

    fn small_als() -> Als {
        Als::new(AlsConfig {
            factors: 8,
            iterations: 6,
            num_workers: 2,
            ..AlsConfig::default()
        })
    }

    #[tokio::test]
    async fn test_in_cluster_item_outranks_cross_cluster() {
        let als = small_als();
        let ctx = CancellationToken::new();
        let mut interactions = two_cluster_interactions();
        // User 7 watched 10 only; 11 is in-cluster, 20 is not.
        interactions.push(Interaction::new(7, 10, 0.9));
        als.train(&ctx, &interactions, &[]).await.unwrap();

        let scores = als.predict(&ctx, 7, &[11, 20]).await.unwrap();
        assert!(scores[&11] > scores[&20]);
    }

    #[tokio::test]
    async fn test_training_is_deterministic() {
        let ctx = CancellationToken::new();
        let interactions = two_cluster_interactions();

        let first = small_als();
        first.train(&ctx, &interactions, &[]).await.unwrap();
        let second = small_als();
        second.train(&ctx, &interactions, &[]).await.unwrap();

        let a = first.predict(&ctx, 1, &[20, 21]).await.unwrap();
        let b = second.predict(&ctx, 1, &[20, 21]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_similar_items_share_audience() {
        let als = small_als();
        let ctx = CancellationToken::new();
        als.train(&ctx, &two_cluster_interactions(), &[])
            .await
            .unwrap();

        let scores = als.predict_similar(&ctx, 10, &[11, 20]).await.unwrap();
        assert!(scores[&11] > scores[&20]);
    }

    #[tokio::test]
    async fn test_version_bumps_per_train() {
        let als = small_als();
        let ctx = CancellationToken::new();
        let interactions = two_cluster_interactions();
        als.train(&ctx, &interactions, &[]).await.unwrap();
        als.train(&ctx, &interactions, &[]).await.unwrap();
        assert_eq!(als.version().await, 2);
    }
}
