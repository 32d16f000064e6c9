//! Popularity baseline: confidence mass per item, user-independent.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::Result;
use crate::types::{Interaction, Item, ItemId, UserId};

/// Hook for weighting an interaction's contribution by its age. Unused by
/// default so rankings stay deterministic.
pub type DecayFn = fn(&Interaction) -> f64;

/// Popularity hyperparameters.
#[derive(Debug, Clone)]
pub struct PopularityConfig {
    /// Items retained in the ranking.
    pub max_items: usize,

    pub min_confidence: f64,

    /// Optional time-decay weighting.
    pub decay: Option<DecayFn>,
}

impl Default for PopularityConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            min_confidence: 0.1,
            decay: None,
        }
    }
}

struct PopularityModel {
    /// item -> total confidence, only the top max_items entries.
    scores: HashMap<ItemId, f64>,
}

/// Global popularity ranking.
pub struct Popularity {
    config: PopularityConfig,
    state: ModelLock<PopularityModel>,
}

impl Popularity {
    pub fn new(config: PopularityConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }
}

impl Default for Popularity {
    fn default() -> Self {
        Self::new(PopularityConfig::default())
    }
}

#[async_trait]
impl Algorithm for Popularity {
    fn name(&self) -> &'static str {
        "popularity"
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

        let mut totals: HashMap<ItemId, f64> = HashMap::new();
        for interaction in interactions {
            if !interaction.is_usable(self.config.min_confidence) {
                continue;
            }
            let weight = self.config.decay.map_or(1.0, |f| f(interaction));
            *totals.entry(interaction.item_id).or_insert(0.0) +=
                interaction.confidence * weight;
        }

        let mut ranked: Vec<(ItemId, f64)> = totals.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.config.max_items);

        info!(items = ranked.len(), "popularity training finished");
        slot.install(PopularityModel {
            scores: ranked.into_iter().collect(),
        });
        Ok(())
    }

    /// Popularity ignores the user entirely.
    async fn predict(
        &self,
        ctx: &CancellationToken,
        _user_id: UserId,
        candidates: &[ItemId],
    ) -> Result<ScoreMap> {
        ensure_active(ctx)?;
        let slot = self.state.read().await;
        let Some(model) = slot.model.as_ref() else {
            return Ok(ScoreMap::new());
        };

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            if let Some(&score) = model.scores.get(&candidate) {
                scores.insert(candidate, score);
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
        for &candidate in candidates {
            if candidate == item_id {
                continue;
            }
            if let Some(&score) = model.scores.get(&candidate) {
                scores.insert(candidate, score);
            }
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}
