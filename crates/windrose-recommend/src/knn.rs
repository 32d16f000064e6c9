//! Neighborhood collaborative filtering: user-based and item-based variants
//! over a configurable similarity metric with shrinkage and top-K truncation.

use async_trait::async_trait;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::{RecommendError, Result};
use crate::math::{cosine, jaccard, pearson};
use crate::types::{Interaction, Item, ItemId, UserId};

/// Pairwise similarity measure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    Cosine,
    Pearson,
    Jaccard,
}

/// Shared configuration for both neighborhood variants.
#[derive(Debug, Clone)]
pub struct KnnConfig {
    pub metric: SimilarityMetric,

    /// Minimum co-rated overlap before a similarity counts.
    pub min_common_items: usize,

    /// Shrinkage toward zero for thin overlaps: sim * n / (n + shrinkage).
    pub shrinkage: f64,

    /// Neighbors retained per entity.
    pub top_k: usize,

    pub min_confidence: f64,
    pub num_workers: usize,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            metric: SimilarityMetric::Cosine,
            min_common_items: 2,
            shrinkage: 10.0,
            top_k: 50,
            min_confidence: 0.1,
            num_workers: 4,
        }
    }
}

/// Similarity between two sparse rating vectors under the configured metric.
pub(crate) fn rating_similarity(
    config: &KnnConfig,
    a: &HashMap<i64, f64>,
    b: &HashMap<i64, f64>,
) -> f64 {
    let common: Vec<i64> = a.keys().filter(|k| b.contains_key(*k)).copied().collect();
    if common.len() < config.min_common_items {
        return 0.0;
    }

    let raw = match config.metric {
        SimilarityMetric::Cosine => {
            // Dense the union for a true cosine over both vectors.
            let keys: HashSet<i64> = a.keys().chain(b.keys()).copied().collect();
            let mut va = Vec::with_capacity(keys.len());
            let mut vb = Vec::with_capacity(keys.len());
            for key in keys {
                va.push(a.get(&key).copied().unwrap_or(0.0));
                vb.push(b.get(&key).copied().unwrap_or(0.0));
            }
            cosine(&va, &vb)
        }
        SimilarityMetric::Pearson => {
            let va: Vec<f64> = common.iter().map(|k| a[k]).collect();
            let vb: Vec<f64> = common.iter().map(|k| b[k]).collect();
            pearson(&va, &vb)
        }
        SimilarityMetric::Jaccard => {
            let sa: HashSet<i64> = a.keys().copied().collect();
            let sb: HashSet<i64> = b.keys().copied().collect();
            jaccard(&sa, &sb)
        }
    };

    let n = common.len() as f64;
    raw * n / (n + config.shrinkage)
}

/// Pairwise neighbor computation over the outer loop, fanned out across the
/// configured worker count.
pub(crate) fn neighbor_table(
    config: &KnnConfig,
    vectors: &HashMap<i64, HashMap<i64, f64>>,
) -> Result<HashMap<i64, Vec<(i64, f64)>>> {
    let entities: Vec<i64> = vectors.keys().copied().collect();
    let table = Mutex::new(HashMap::with_capacity(entities.len()));
    let workers = config.num_workers.max(1);
    let chunk = entities.len().div_ceil(workers).max(1);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| RecommendError::Numerical(e.to_string()))?;
    pool.install(|| {
        entities.par_chunks(chunk).for_each(|shard| {
            let mut local: Vec<(i64, Vec<(i64, f64)>)> = Vec::with_capacity(shard.len());
            for &entity in shard {
                let mine = &vectors[&entity];
                let mut neighbors: Vec<(i64, f64)> = Vec::new();
                for (&other, theirs) in vectors {
                    if other == entity {
                        continue;
                    }
                    let similarity = rating_similarity(config, mine, theirs);
                    if similarity > 0.0 {
                        neighbors.push((other, similarity));
                    }
                }
                neighbors
                    .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                neighbors.truncate(config.top_k);
                local.push((entity, neighbors));
            }
            let mut merged = table.lock().unwrap_or_else(|e| e.into_inner());
            merged.extend(local);
        });
    });

    Ok(table.into_inner().unwrap_or_else(|e| e.into_inner()))
}

/// Collect per-entity rating vectors, keyed by user or by item.
fn rating_vectors(
    interactions: &[Interaction],
    min_confidence: f64,
    by_user: bool,
) -> HashMap<i64, HashMap<i64, f64>> {
    let mut vectors: HashMap<i64, HashMap<i64, f64>> = HashMap::new();
    for interaction in interactions {
        if !interaction.is_usable(min_confidence) {
            continue;
        }
        let (key, axis) = if by_user {
            (interaction.user_id, interaction.item_id)
        } else {
            (interaction.item_id, interaction.user_id)
        };
        let slot = vectors.entry(key).or_default().entry(axis).or_insert(0.0);
        if interaction.confidence > *slot {
            *slot = interaction.confidence;
        }
    }
    vectors
}

struct UserCfModel {
    /// user -> item -> confidence
    ratings: HashMap<i64, HashMap<i64, f64>>,
    /// user -> top-K similar users
    neighbors: HashMap<i64, Vec<(i64, f64)>>,
}

/// User-based neighborhood CF.
pub struct UserBasedCf {
    config: KnnConfig,
    state: ModelLock<UserCfModel>,
}

impl UserBasedCf {
    pub fn new(config: KnnConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }
}

impl Default for UserBasedCf {
    fn default() -> Self {
        Self::new(KnnConfig::default())
    }
}

#[async_trait]
impl Algorithm for UserBasedCf {
    fn name(&self) -> &'static str {
        "user_based_cf"
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

        let ratings = rating_vectors(interactions, self.config.min_confidence, true);
        ensure_active(ctx)?;
        let neighbors = neighbor_table(&self.config, &ratings)?;

        info!(users = ratings.len(), "user-based cf training finished");
        slot.install(UserCfModel { ratings, neighbors });
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
        let Some(neighbors) = model.neighbors.get(&user_id) else {
            return Ok(ScoreMap::new());
        };

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            let mut weighted = 0.0;
            let mut weight = 0.0;
            for &(neighbor, similarity) in neighbors {
                if let Some(rating) = model
                    .ratings
                    .get(&neighbor)
                    .and_then(|r| r.get(&candidate))
                {
                    weighted += similarity * rating;
                    weight += similarity.abs();
                }
            }
            if weight > 0.0 {
                scores.insert(candidate, weighted / weight);
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

        // Item vectors over the user axis, derived from the stored ratings.
        let mut probe: HashMap<i64, f64> = HashMap::new();
        for (&user, ratings) in &model.ratings {
            if let Some(&rating) = ratings.get(&item_id) {
                probe.insert(user, rating);
            }
        }
        if probe.is_empty() {
            return Ok(ScoreMap::new());
        }

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            if candidate == item_id {
                continue;
            }
            let mut other: HashMap<i64, f64> = HashMap::new();
            for (&user, ratings) in &model.ratings {
                if let Some(&rating) = ratings.get(&candidate) {
                    other.insert(user, rating);
                }
            }
            if other.is_empty() {
                continue;
            }
            let similarity = rating_similarity(&self.config, &probe, &other);
            if similarity > 0.0 {
                scores.insert(candidate, similarity);
            }
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}

struct ItemCfModel {
    /// user -> item -> confidence
    user_ratings: HashMap<i64, HashMap<i64, f64>>,
    /// item -> top-K similar items
    neighbors: HashMap<i64, Vec<(i64, f64)>>,
}

/// Item-based neighborhood CF.
pub struct ItemBasedCf {
    config: KnnConfig,
    state: ModelLock<ItemCfModel>,
}

impl ItemBasedCf {
    pub fn new(config: KnnConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }
}

impl Default for ItemBasedCf {
    fn default() -> Self {
        Self::new(KnnConfig::default())
    }
}

#[async_trait]
impl Algorithm for ItemBasedCf {
    fn name(&self) -> &'static str {
        "item_based_cf"
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

        let item_vectors = rating_vectors(interactions, self.config.min_confidence, false);
        let user_ratings = rating_vectors(interactions, self.config.min_confidence, true);
        ensure_active(ctx)?;
        let neighbors = neighbor_table(&self.config, &item_vectors)?;

        info!(items = item_vectors.len(), "item-based cf training finished");
        slot.install(ItemCfModel {
            user_ratings,
            neighbors,
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
        let Some(history) = model.user_ratings.get(&user_id) else {
            return Ok(ScoreMap::new());
        };

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            let Some(neighbors) = model.neighbors.get(&candidate) else {
                continue;
            };
            let mut weighted = 0.0;
            let mut weight = 0.0;
            for &(item, similarity) in neighbors {
                if let Some(&rating) = history.get(&item) {
                    weighted += similarity * rating;
                    weight += similarity.abs();
                }
            }
            if weight > 0.0 {
                scores.insert(candidate, weighted / weight);
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
        let Some(neighbors) = model.neighbors.get(&item_id) else {
            return Ok(ScoreMap::new());
        };

        let mut scores = ScoreMap::new();
        for &(item, similarity) in neighbors {
            if item == item_id {
                continue;
            }
            if candidates.contains(&item) {
                scores.insert(item, similarity);
            }
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taste_clusters() -> Vec<Interaction> {
        let mut out = Vec::new();
        // Sci-fi watchers.
        for user in 1..=3 {
            out.push(Interaction::new(user, 10, 0.9));
            out.push(Interaction::new(user, 11, 0.8));
            out.push(Interaction::new(user, 12, 0.9));
        }
        // Documentary watchers.
        for user in 4..=6 {
            out.push(Interaction::new(user, 20, 0.9));
            out.push(Interaction::new(user, 21, 0.8));
        }
        // User 7 leans sci-fi but has not seen 12.
        out.push(Interaction::new(7, 10, 0.9));
        out.push(Interaction::new(7, 11, 0.9));
        out
    }

    fn config() -> KnnConfig {
        KnnConfig {
            min_common_items: 1,
            shrinkage: 1.0,
            num_workers: 2,
            ..KnnConfig::default()
        }
    }

    #[tokio::test]
    async fn test_user_based_recommends_from_neighbors() {
        let algorithm = UserBasedCf::new(config());
        let ctx = CancellationToken::new();
        algorithm.train(&ctx, &taste_clusters(), &[]).await.unwrap();

        let scores = algorithm.predict(&ctx, 7, &[12, 20]).await.unwrap();
        assert!(scores.contains_key(&12));
        match scores.get(&20) {
            Some(doc_score) => assert!(scores[&12] > *doc_score),
            None => {} // No overlapping neighbor rated 20 at all.
        }
    }

    #[tokio::test]
    async fn test_item_based_similar_stays_in_cluster() {
        let algorithm = ItemBasedCf::new(config());
        let ctx = CancellationToken::new();
        algorithm.train(&ctx, &taste_clusters(), &[]).await.unwrap();

        let scores = algorithm
            .predict_similar(&ctx, 10, &[11, 12, 20, 21])
            .await
            .unwrap();
        assert!(!scores.contains_key(&10));
        assert!(scores.contains_key(&11));
        assert!(scores.contains_key(&12));
        assert!(!scores.contains_key(&20));
    }

    #[tokio::test]
    async fn test_item_based_predict_weighs_history() {
        let algorithm = ItemBasedCf::new(config());
        let ctx = CancellationToken::new();
        algorithm.train(&ctx, &taste_clusters(), &[]).await.unwrap();

        let scores = algorithm.predict(&ctx, 7, &[12, 20]).await.unwrap();
        assert!(scores.contains_key(&12));
        assert!(!scores.contains_key(&20));
    }

    #[tokio::test]
    async fn test_jaccard_metric_ignores_confidence() {
        let algorithm = UserBasedCf::new(KnnConfig {
            metric: SimilarityMetric::Jaccard,
            ..config()
        });
        let ctx = CancellationToken::new();
        algorithm.train(&ctx, &taste_clusters(), &[]).await.unwrap();
        let scores = algorithm.predict(&ctx, 7, &[12]).await.unwrap();
        assert!(scores.contains_key(&12));
    }

    #[tokio::test]
    async fn test_min_common_gate() {
        let algorithm = UserBasedCf::new(KnnConfig {
            min_common_items: 5,
            ..config()
        });
        let ctx = CancellationToken::new();
        algorithm.train(&ctx, &taste_clusters(), &[]).await.unwrap();
        // Nobody shares five items, so no neighbors and no predictions.
        let scores = algorithm.predict(&ctx, 7, &[12]).await.unwrap();
        assert!(scores.is_empty());
    }
}
