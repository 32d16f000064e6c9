//! # Windrose Recommend - Offline Training & Scoring Engine
//!
//! `windrose-recommend` implements the platform's recommendation algorithms
//! behind one training/prediction contract: collaborative filtering (EASE,
//! ALS, user/item KNN, time-aware CF), sequential models (co-visitation,
//! first-order Markov chain, FPMC), graph and content scoring (multi-hop
//! item CF, content profiles, popularity), and a LinUCB contextual bandit
//! plus BPR pairwise factorization.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use windrose_recommend::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let recommender = Recommender::new();
//! let ctx = CancellationToken::new();
//!
//! let interactions = vec![Interaction::new(1, 42, 0.9)];
//! recommender.train_all(&ctx, &interactions, &[]).await?;
//!
//! let scores = recommender.predict(&ctx, "popularity", 1, &[42, 43]).await?;
//! assert!(scores.values().all(|s| (0.0..=1.0).contains(s)));
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod als;
pub mod bpr;
pub mod content;
pub mod covisitation;
pub mod ease;
pub mod error;
pub mod fpmc;
pub mod knn;
pub mod linucb;
pub mod markov;
pub mod math;
pub mod multihop;
pub mod popularity;
pub mod recommender;
pub mod time_aware;
pub mod types;

pub use error::{RecommendError, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::algorithm::{Algorithm, ScoreMap};
    pub use crate::als::{Als, AlsConfig};
    pub use crate::bpr::{Bpr, BprConfig};
    pub use crate::content::{ContentBased, ContentConfig};
    pub use crate::covisitation::{Covisitation, CovisitationConfig};
    pub use crate::ease::{Ease, EaseConfig};
    pub use crate::error::{RecommendError, Result};
    pub use crate::fpmc::{Fpmc, FpmcConfig};
    pub use crate::knn::{ItemBasedCf, KnnConfig, SimilarityMetric, UserBasedCf};
    pub use crate::linucb::{LinUcb, LinUcbConfig};
    pub use crate::markov::{MarkovChain, MarkovConfig};
    pub use crate::multihop::{MultiHopConfig, MultiHopItemCf};
    pub use crate::popularity::{Popularity, PopularityConfig};
    pub use crate::recommender::{Recommender, TrainReport};
    pub use crate::time_aware::{CfMode, TimeAwareCf, TimeAwareConfig};
    pub use crate::types::{Interaction, InteractionType, Item, ItemId, UserId};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
