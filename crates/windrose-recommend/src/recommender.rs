//! Registry facade owning one instance of every algorithm behind the shared
//! contract.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::algorithm::{ensure_active, Algorithm, ScoreMap};
use crate::als::Als;
use crate::bpr::Bpr;
use crate::content::ContentBased;
use crate::covisitation::Covisitation;
use crate::ease::Ease;
use crate::error::Result;
use crate::fpmc::Fpmc;
use crate::knn::{ItemBasedCf, UserBasedCf};
use crate::linucb::LinUcb;
use crate::markov::MarkovChain;
use crate::multihop::MultiHopItemCf;
use crate::popularity::Popularity;
use crate::time_aware::TimeAwareCf;
use crate::types::{Interaction, Item, ItemId, UserId};

/// Outcome of a `train_all` sweep.
#[derive(Debug, Default)]
pub struct TrainReport {
    pub trained: Vec<&'static str>,
    pub failures: Vec<(&'static str, String)>,
}

/// Owns every algorithm with its default configuration. Callers needing
/// custom hyperparameters construct the algorithms directly.
pub struct Recommender {
    algorithms: HashMap<&'static str, Arc<dyn Algorithm>>,
}

impl Recommender {
    pub fn new() -> Self {
        let algorithms: Vec<Arc<dyn Algorithm>> = vec![
            Arc::new(Ease::default()),
            Arc::new(Als::default()),
            Arc::new(UserBasedCf::default()),
            Arc::new(ItemBasedCf::default()),
            Arc::new(TimeAwareCf::default()),
            Arc::new(Covisitation::default()),
            Arc::new(MarkovChain::default()),
            Arc::new(Fpmc::default()),
            Arc::new(MultiHopItemCf::default()),
            Arc::new(ContentBased::default()),
            Arc::new(Popularity::default()),
            Arc::new(LinUcb::default()),
            Arc::new(Bpr::default()),
        ];
        Self {
            algorithms: algorithms.into_iter().map(|a| (a.name(), a)).collect(),
        }
    }

    /// Registered algorithm names.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.algorithms.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Look up one algorithm by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Algorithm>> {
        self.algorithms.get(name)
    }

    /// Train every algorithm sequentially. One failure does not abort the
    /// rest; failures are logged and collected in the report. Cancellation
    /// is observed between algorithms.
    pub async fn train_all(
        &self,
        ctx: &CancellationToken,
        interactions: &[Interaction],
        items: &[Item],
    ) -> Result<TrainReport> {
        let mut report = TrainReport::default();
        for name in self.names() {
            ensure_active(ctx)?;
            let Some(algorithm) = self.algorithms.get(name) else {
                continue;
            };
            match algorithm.train(ctx, interactions, items).await {
                Ok(()) => {
                    info!(algorithm = name, "trained");
                    report.trained.push(name);
                }
                Err(err) => {
                    error!(algorithm = name, error = %err, "training failed");
                    report.failures.push((name, err.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Predict through a named algorithm. Unknown names yield an empty map.
    pub async fn predict(
        &self,
        ctx: &CancellationToken,
        name: &str,
        user_id: UserId,
        candidates: &[ItemId],
    ) -> Result<ScoreMap> {
        match self.algorithms.get(name) {
            Some(algorithm) => algorithm.predict(ctx, user_id, candidates).await,
            None => Ok(ScoreMap::new()),
        }
    }

    /// Similar-items through a named algorithm. Unknown names yield an empty
    /// map.
    pub async fn predict_similar(
        &self,
        ctx: &CancellationToken,
        name: &str,
        item_id: ItemId,
        candidates: &[ItemId],
    ) -> Result<ScoreMap> {
        match self.algorithms.get(name) {
            Some(algorithm) => algorithm.predict_similar(ctx, item_id, candidates).await,
            None => Ok(ScoreMap::new()),
        }
    }
}

impl Default for Recommender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every algorithm the crate exports, by registered name. Registering a
    /// new algorithm without extending this list fails the tests below.
    const EXPORTED: [&str; 13] = [
        "als",
        "bpr",
        "content_based",
        "covisitation",
        "ease",
        "fpmc",
        "item_based_cf",
        "linucb",
        "markov_chain",
        "multi_hop_item_cf",
        "popularity",
        "time_aware_cf",
        "user_based_cf",
    ];

    #[tokio::test]
    async fn test_registry_covers_every_exported_algorithm() {
        let recommender = Recommender::new();
        assert_eq!(recommender.names(), EXPORTED);
        for name in EXPORTED {
            assert!(recommender.get(name).is_some(), "{} not registered", name);
        }
        assert!(recommender.get("no_such_algorithm").is_none());
    }

    #[tokio::test]
    async fn test_train_all_and_query() {
        let recommender = Recommender::new();
        let ctx = CancellationToken::new();
        let interactions = vec![
            Interaction::new(1, 10, 0.9),
            Interaction::new(1, 11, 0.9),
            Interaction::new(2, 10, 0.9),
            Interaction::new(2, 11, 0.9),
        ];

        let report = recommender.train_all(&ctx, &interactions, &[]).await.unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.trained, recommender.names());

        let scores = recommender
            .predict(&ctx, "popularity", 1, &[10, 11])
            .await
            .unwrap();
        assert!(!scores.is_empty());

        let missing = recommender
            .predict(&ctx, "no_such_algorithm", 1, &[10])
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_train_all_observes_cancellation() {
        let recommender = Recommender::new();
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(recommender.train_all(&ctx, &[], &[]).await.is_err());
    }
}
