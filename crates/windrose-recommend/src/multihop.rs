//! Multi-hop item CF: iterative frontier expansion over a truncated
//! item-item cosine table, with per-hop decay and a global visited set.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::Result;
use crate::types::{Interaction, Item, ItemId, UserId};

/// Multi-hop hyperparameters.
#[derive(Debug, Clone)]
pub struct MultiHopConfig {
    /// Neighbors retained per item in the similarity table.
    pub top_k_per_hop: usize,

    /// Hops to expand.
    pub num_hops: usize,

    /// Score multiplier per hop depth.
    pub decay_factor: f64,

    pub min_confidence: f64,
}

impl Default for MultiHopConfig {
    fn default() -> Self {
        Self {
            top_k_per_hop: 50,
            num_hops: 2,
            decay_factor: 0.5,
            min_confidence: 0.1,
        }
    }
}

struct MultiHopModel {
    item_ids: Vec<ItemId>,
    item_index: HashMap<ItemId, usize>,
    /// item index -> [(neighbor index, similarity)], truncated per item.
    neighbors: Vec<Vec<(usize, f64)>>,
    /// user -> [(item index, confidence)]
    user_histories: HashMap<UserId, Vec<(usize, f64)>>,
}

/// Graph-propagation recommender.
pub struct MultiHopItemCf {
    config: MultiHopConfig,
    state: ModelLock<MultiHopModel>,
}

impl MultiHopItemCf {
    pub fn new(config: MultiHopConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }

    /// Expand frontiers hop by hop, accumulating decayed scores. Iterative
    /// with a visited set, never recursive.
    fn propagate(&self, model: &MultiHopModel, seeds: &[(usize, f64)]) -> HashMap<usize, f64> {
        let mut scores: HashMap<usize, f64> = HashMap::new();
        let mut visited: HashSet<usize> = seeds.iter().map(|&(i, _)| i).collect();
        let mut frontier: Vec<(usize, f64)> = seeds.to_vec();

        for hop in 1..=self.config.num_hops {
            let decay = self.config.decay_factor.powi(hop as i32);
            let mut next_frontier: Vec<(usize, f64)> = Vec::new();

            for &(item, weight) in &frontier {
                for &(neighbor, similarity) in &model.neighbors[item] {
                    let contribution = decay * weight * similarity;
                    if contribution == 0.0 {
                        continue;
                    }
                    *scores.entry(neighbor).or_insert(0.0) += contribution;
                    if visited.insert(neighbor) {
                        next_frontier.push((neighbor, weight * similarity));
                    }
                }
            }

            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }
        scores
    }
}

impl Default for MultiHopItemCf {
    fn default() -> Self {
        Self::new(MultiHopConfig::default())
    }
}

#[async_trait]
impl Algorithm for MultiHopItemCf {
    fn name(&self) -> &'static str {
        "multi_hop_item_cf"
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

        // Item vectors over users.
        let mut item_index: HashMap<ItemId, usize> = HashMap::new();
        let mut item_ids: Vec<ItemId> = Vec::new();
        let mut vectors: Vec<HashMap<UserId, f64>> = Vec::new();
        let mut user_histories: HashMap<UserId, Vec<(usize, f64)>> = HashMap::new();
        for interaction in interactions {
            if !interaction.is_usable(self.config.min_confidence) {
                continue;
            }
            let index = *item_index.entry(interaction.item_id).or_insert_with(|| {
                item_ids.push(interaction.item_id);
                vectors.push(HashMap::new());
                item_ids.len() - 1
            });
            let slot = vectors[index].entry(interaction.user_id).or_insert(0.0);
            if interaction.confidence > *slot {
                *slot = interaction.confidence;
            }
            let history = user_histories.entry(interaction.user_id).or_default();
            match history.iter_mut().find(|(i, _)| *i == index) {
                Some(entry) if interaction.confidence > entry.1 => {
                    entry.1 = interaction.confidence
                }
                Some(_) => {}
                None => history.push((index, interaction.confidence)),
            }
        }

        ensure_active(ctx)?;

        // Truncated cosine table.
        let n = item_ids.len();
        let norms: Vec<f64> = vectors
            .iter()
            .map(|v| v.values().map(|c| c * c).sum::<f64>().sqrt())
            .collect();
        let mut neighbors: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
        for a in 0..n {
            let mut row: Vec<(usize, f64)> = Vec::new();
            for b in 0..n {
                if a == b || norms[a] == 0.0 || norms[b] == 0.0 {
                    continue;
                }
                let dot: f64 = vectors[a]
                    .iter()
                    .filter_map(|(user, ca)| vectors[b].get(user).map(|cb| ca * cb))
                    .sum();
                if dot > 0.0 {
                    row.push((b, dot / (norms[a] * norms[b])));
                }
            }
            row.sort_by(|x, y| y.1.partial_cmp(&x.1).unwrap_or(std::cmp::Ordering::Equal));
            row.truncate(self.config.top_k_per_hop);
            neighbors.push(row);
        }

        info!(items = n, "multi-hop training finished");
        slot.install(MultiHopModel {
            item_ids,
            item_index,
            neighbors,
            user_histories,
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

        let propagated = self.propagate(model, history);
        let watched: HashSet<usize> = history.iter().map(|&(i, _)| i).collect();

        let mut scores = ScoreMap::new();
        for (index, score) in propagated {
            if watched.contains(&index) {
                continue;
            }
            let id = model.item_ids[index];
            if candidates.contains(&id) {
                scores.insert(id, score);
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
        let Some(&probe) = model.item_index.get(&item_id) else {
            return Ok(ScoreMap::new());
        };

        let propagated = self.propagate(model, &[(probe, 1.0)]);
        let mut scores = ScoreMap::new();
        for (index, score) in propagated {
            let id = model.item_ids[index];
            if id != item_id && candidates.contains(&id) {
                scores.insert(id, score);
            }
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}
