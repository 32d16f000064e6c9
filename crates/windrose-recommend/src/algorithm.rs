//! The contract every recommendation algorithm implements, plus the shared
//! lock discipline for model state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{RecommendError, Result};
use crate::types::{Interaction, Item, ItemId, UserId};

/// Candidate scores keyed by item id. Ids the model cannot score are absent,
/// never zero.
pub type ScoreMap = HashMap<ItemId, f64>;

/// Capability set shared by all recommendation algorithms.
///
/// `train` fully re-populates model state under an exclusive lock; `predict`
/// and `predict_similar` run under a shared lock and return an empty map
/// (not an error) for unknown users, items, or an untrained model.
#[async_trait]
pub trait Algorithm: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_trained(&self) -> bool;

    /// Increments on every successful train.
    async fn version(&self) -> u64;

    async fn last_trained_at(&self) -> Option<DateTime<Utc>>;

    async fn train(
        &self,
        ctx: &CancellationToken,
        interactions: &[Interaction],
        items: &[Item],
    ) -> Result<()>;

    async fn predict(
        &self,
        ctx: &CancellationToken,
        user_id: UserId,
        candidates: &[ItemId],
    ) -> Result<ScoreMap>;

    async fn predict_similar(
        &self,
        ctx: &CancellationToken,
        item_id: ItemId,
        candidates: &[ItemId],
    ) -> Result<ScoreMap>;
}

/// Model state plus training bookkeeping, guarded together so version and
/// timestamp always describe the installed model.
pub struct ModelSlot<M> {
    pub model: Option<M>,
    pub version: u64,
    pub last_trained_at: Option<DateTime<Utc>>,
}

impl<M> ModelSlot<M> {
    /// Install a freshly trained model, bumping the version while the caller
    /// still holds the exclusive lock.
    pub fn install(&mut self, model: M) {
        self.model = Some(model);
        self.version += 1;
        self.last_trained_at = Some(Utc::now());
    }
}

/// Lock wrapper realizing the shared base-algorithm as composition: exclusive
/// during train, shared during predict.
pub struct ModelLock<M> {
    slot: RwLock<ModelSlot<M>>,
}

impl<M: Send + Sync> ModelLock<M> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(ModelSlot {
                model: None,
                version: 0,
                last_trained_at: None,
            }),
        }
    }

    /// Shared access for prediction and bookkeeping reads.
    pub async fn read(&self) -> RwLockReadGuard<'_, ModelSlot<M>> {
        self.slot.read().await
    }

    /// Exclusive access for the duration of a train run.
    pub async fn write(&self) -> RwLockWriteGuard<'_, ModelSlot<M>> {
        self.slot.write().await
    }

    pub async fn is_trained(&self) -> bool {
        self.slot.read().await.model.is_some()
    }

    pub async fn version(&self) -> u64 {
        self.slot.read().await.version
    }

    pub async fn last_trained_at(&self) -> Option<DateTime<Utc>> {
        self.slot.read().await.last_trained_at
    }
}

impl<M: Send + Sync> Default for ModelLock<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fail fast when the caller's context has been cancelled. Training loops
/// call this between outer phases.
pub fn ensure_active(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(RecommendError::Cancelled);
    }
    Ok(())
}

/// Min-max normalize scores into [0, 1] in place.
///
/// Degenerate spreads: a single entry scores 1.0 (it is the best on offer);
/// several equal entries all score 0.5.
pub fn normalize_scores(scores: &mut ScoreMap) {
    if scores.is_empty() {
        return;
    }
    if scores.len() == 1 {
        for value in scores.values_mut() {
            *value = 1.0;
        }
        return;
    }

    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &value in scores.values() {
        min = min.min(value);
        max = max.max(value);
    }

    let spread = max - min;
    for value in scores.values_mut() {
        *value = if spread > 0.0 {
            (*value - min) / spread
        } else {
            0.5
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_spreads_to_unit_interval() {
        let mut scores: ScoreMap = [(1, 2.0), (2, 4.0), (3, 6.0)].into_iter().collect();
        normalize_scores(&mut scores);
        assert_relative_eq!(scores[&1], 0.0);
        assert_relative_eq!(scores[&2], 0.5);
        assert_relative_eq!(scores[&3], 1.0);
    }

    #[test]
    fn test_normalize_equal_scores() {
        let mut scores: ScoreMap = [(1, 3.0), (2, 3.0)].into_iter().collect();
        normalize_scores(&mut scores);
        assert_relative_eq!(scores[&1], 0.5);
        assert_relative_eq!(scores[&2], 0.5);
    }

    #[test]
    fn test_normalize_single_entry_is_top_score() {
        let mut scores: ScoreMap = [(7, 0.25)].into_iter().collect();
        normalize_scores(&mut scores);
        assert_relative_eq!(scores[&7], 1.0);
    }

    #[test]
    fn test_normalize_empty_is_noop() {
        let mut scores = ScoreMap::new();
        normalize_scores(&mut scores);
        assert!(scores.is_empty());
    }

    #[tokio::test]
    async fn test_model_slot_versioning() {
        let lock: ModelLock<Vec<u32>> = ModelLock::new();
        assert!(!lock.is_trained().await);
        assert_eq!(lock.version().await, 0);

        {
            let mut slot = lock.write().await;
            slot.install(vec![1, 2, 3]);
        }
        assert!(lock.is_trained().await);
        assert_eq!(lock.version().await, 1);
        assert!(lock.last_trained_at().await.is_some());
    }

    #[test]
    fn test_cancellation_guard() {
        let ctx = CancellationToken::new();
        assert!(ensure_active(&ctx).is_ok());
        ctx.cancel();
        assert!(matches!(
            ensure_active(&ctx),
            Err(RecommendError::Cancelled)
        ));
    }
}
