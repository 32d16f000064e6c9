//! Time-aware collaborative filtering: exponential recency weighting on top
//! of the weighted-cosine neighborhood machinery.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::Result;
use crate::knn::{neighbor_table, rating_similarity, KnnConfig, SimilarityMetric};
use crate::types::{Interaction, Item, ItemId, UserId};

/// Which axis the neighborhood forms over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CfMode {
    UserBased,
    ItemBased,
}

/// Time-aware CF hyperparameters.
#[derive(Debug, Clone)]
pub struct TimeAwareConfig {
    pub mode: CfMode,

    /// Exponential decay rate applied per decay unit of age.
    pub decay_rate: f64,

    /// Age unit in days for the decay exponent.
    pub decay_unit_days: f64,

    /// Floor for the recency weight.
    pub min_weight: f64,

    /// Interactions older than this are discarded outright.
    pub max_lookback_days: u32,

    /// Fixed reference time for deterministic training; wall clock when
    /// absent.
    pub reference_time: Option<DateTime<Utc>>,

    pub min_confidence: f64,
    pub min_common_items: usize,
    pub shrinkage: f64,
    pub top_k: usize,
    pub num_workers: usize,
}

impl Default for TimeAwareConfig {
    fn default() -> Self {
        Self {
            mode: CfMode::ItemBased,
            decay_rate: 0.1,
            decay_unit_days: 7.0,
            min_weight: 0.1,
            max_lookback_days: 365,
            reference_time: None,
            min_confidence: 0.1,
            min_common_items: 2,
            shrinkage: 10.0,
            top_k: 50,
            num_workers: 4,
        }
    }
}

impl TimeAwareConfig {
    fn knn(&self) -> KnnConfig {
        KnnConfig {
            metric: SimilarityMetric::Cosine,
            min_common_items: self.min_common_items,
            shrinkage: self.shrinkage,
            top_k: self.top_k,
            min_confidence: self.min_confidence,
            num_workers: self.num_workers,
        }
    }
}

struct TimeAwareModel {
    /// user -> item -> time-weighted confidence
    user_ratings: HashMap<i64, HashMap<i64, f64>>,
    /// Neighbors over the configured axis.
    neighbors: HashMap<i64, Vec<(i64, f64)>>,
    mode: CfMode,
}

/// Recency-weighted neighborhood CF.
pub struct TimeAwareCf {
    config: TimeAwareConfig,
    state: ModelLock<TimeAwareModel>,
}

impl TimeAwareCf {
    pub fn new(config: TimeAwareConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }

    /// Recency weight of an interaction aged `age` relative to the reference.
    fn weight(&self, age: Duration) -> f64 {
        let age_units = age.num_seconds().max(0) as f64 / (self.config.decay_unit_days * 86_400.0);
        (-self.config.decay_rate * age_units)
            .exp()
            .max(self.config.min_weight)
    }
}

impl Default for TimeAwareCf {
    fn default() -> Self {
        Self::new(TimeAwareConfig::default())
    }
}

#[async_trait]
impl Algorithm for TimeAwareCf {
    fn name(&self) -> &'static str {
        "time_aware_cf"
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

        let reference = self.config.reference_time.unwrap_or_else(Utc::now);
        let lookback = Duration::days(i64::from(self.config.max_lookback_days));

        let mut user_ratings: HashMap<i64, HashMap<i64, f64>> = HashMap::new();
        let mut axis_vectors: HashMap<i64, HashMap<i64, f64>> = HashMap::new();
        for interaction in interactions {
            if !interaction.is_usable(self.config.min_confidence) {
                continue;
            }
            // Untimestamped events count as fresh.
            let age = interaction
                .timestamp
                .map(|ts| reference - ts)
                .unwrap_or_else(Duration::zero);
            if age > lookback {
                continue;
            }
            let weighted = interaction.confidence * self.weight(age);

            let slot = user_ratings
                .entry(interaction.user_id)
                .or_default()
                .entry(interaction.item_id)
                .or_insert(0.0);
            if weighted > *slot {
                *slot = weighted;
            }

            let (key, axis) = match self.config.mode {
                CfMode::UserBased => (interaction.user_id, interaction.item_id),
                CfMode::ItemBased => (interaction.item_id, interaction.user_id),
            };
            let slot = axis_vectors.entry(key).or_default().entry(axis).or_insert(0.0);
            if weighted > *slot {
                *slot = weighted;
            }
        }

        ensure_active(ctx)?;
        let neighbors = neighbor_table(&self.config.knn(), &axis_vectors)?;

        info!(
            entities = axis_vectors.len(),
            mode = ?self.config.mode,
            "time-aware cf training finished"
        );
        slot.install(TimeAwareModel {
            user_ratings,
            neighbors,
            mode: self.config.mode,
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

        let mut scores = ScoreMap::new();
        match model.mode {
            CfMode::UserBased => {
                let Some(neighbors) = model.neighbors.get(&user_id) else {
                    return Ok(ScoreMap::new());
                };
                for &candidate in candidates {
                    let mut weighted = 0.0;
                    let mut weight = 0.0;
                    for &(neighbor, similarity) in neighbors {
                        if let Some(&rating) = model
                            .user_ratings
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
            }
            CfMode::ItemBased => {
                let Some(history) = model.user_ratings.get(&user_id) else {
                    return Ok(ScoreMap::new());
                };
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

        let mut scores = ScoreMap::new();
        match model.mode {
            CfMode::ItemBased => {
                let Some(neighbors) = model.neighbors.get(&item_id) else {
                    return Ok(ScoreMap::new());
                };
                for &(item, similarity) in neighbors {
                    if item != item_id && candidates.contains(&item) {
                        scores.insert(item, similarity);
                    }
                }
            }
            CfMode::UserBased => {
                // Item vectors over users, weighted ratings included.
                let knn = self.config.knn();
                let mut probe: HashMap<i64, f64> = HashMap::new();
                for (&user, ratings) in &model.user_ratings {
                    if let Some(&rating) = ratings.get(&item_id) {
                        probe.insert(user, rating);
                    }
                }
                for &candidate in candidates {
                    if candidate == item_id {
                        continue;
                    }
                    let mut other: HashMap<i64, f64> = HashMap::new();
                    for (&user, ratings) in &model.user_ratings {
                        if let Some(&rating) = ratings.get(&candidate) {
                            other.insert(user, rating);
                        }
                    }
                    let similarity = rating_similarity(&knn, &probe, &other);
                    if similarity > 0.0 {
                        scores.insert(candidate, similarity);
                    }
                }
            }
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}
