//! Content-based filtering: per-user preference profiles over case-folded
//! genre/actor/director tokens plus a year affinity term.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::algorithm::{ensure_active, normalize_scores, Algorithm, ModelLock, ScoreMap};
use crate::error::Result;
use crate::math::jaccard;
use crate::types::{Interaction, Item, ItemId, UserId};

/// Content-based hyperparameters. Category weights are renormalized to sum
/// to one at training time.
#[derive(Debug, Clone)]
pub struct ContentConfig {
    pub genre_weight: f64,
    pub actor_weight: f64,
    pub director_weight: f64,
    pub year_weight: f64,

    /// Year gap at which the year affinity reaches zero.
    pub max_year_diff: f64,

    pub min_confidence: f64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            genre_weight: 0.5,
            actor_weight: 0.2,
            director_weight: 0.2,
            year_weight: 0.1,
            max_year_diff: 10.0,
            min_confidence: 0.1,
        }
    }
}

#[derive(Default, Clone)]
struct Profile {
    genres: HashMap<String, f64>,
    actors: HashMap<String, f64>,
    directors: HashMap<String, f64>,
    /// Confidence-weighted mean release year.
    year_sum: f64,
    year_weight: f64,
}

impl Profile {
    fn preferred_year(&self) -> Option<f64> {
        if self.year_weight > 0.0 {
            Some(self.year_sum / self.year_weight)
        } else {
            None
        }
    }

    fn l1_normalize(&mut self) {
        for table in [&mut self.genres, &mut self.actors, &mut self.directors] {
            let total: f64 = table.values().sum();
            if total > 0.0 {
                for value in table.values_mut() {
                    *value /= total;
                }
            }
        }
    }
}

struct CatalogEntry {
    genres: Vec<String>,
    actors: Vec<String>,
    directors: Vec<String>,
    year: Option<i32>,
    tokens: HashSet<String>,
}

struct ContentModel {
    profiles: HashMap<UserId, Profile>,
    catalog: HashMap<ItemId, CatalogEntry>,
    /// Renormalized (genre, actor, director, year) weights.
    weights: (f64, f64, f64, f64),
}

/// Attribute-profile recommender.
pub struct ContentBased {
    config: ContentConfig,
    state: ModelLock<ContentModel>,
}

impl ContentBased {
    pub fn new(config: ContentConfig) -> Self {
        Self {
            config,
            state: ModelLock::new(),
        }
    }

    fn score_item(&self, model: &ContentModel, profile: &Profile, entry: &CatalogEntry) -> f64 {
        let (wg, wa, wd, wy) = model.weights;

        let genre_score: f64 = entry
            .genres
            .iter()
            .filter_map(|g| profile.genres.get(g))
            .sum();
        let actor_score: f64 = entry
            .actors
            .iter()
            .filter_map(|a| profile.actors.get(a))
            .sum();
        let director_score: f64 = entry
            .directors
            .iter()
            .filter_map(|d| profile.directors.get(d))
            .sum();

        let year_score = match (entry.year, profile.preferred_year()) {
            (Some(year), Some(preferred)) => {
                (1.0 - (f64::from(year) - preferred).abs() / self.config.max_year_diff).max(0.0)
            }
            _ => 0.0,
        };

        wg * genre_score + wa * actor_score + wd * director_score + wy * year_score
    }
}

impl Default for ContentBased {
    fn default() -> Self {
        Self::new(ContentConfig::default())
    }
}

#[async_trait]
impl Algorithm for ContentBased {
    fn name(&self) -> &'static str {
        "content_based"
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
        items: &[Item],
    ) -> Result<()> {
        let mut slot = self.state.write().await;
        ensure_active(ctx)?;

        // Case-folded catalog with namespaced token sets for Jaccard.
        let mut catalog: HashMap<ItemId, CatalogEntry> = HashMap::new();
        for item in items {
            let genres = item.folded_genres();
            let actors = item.folded_actors();
            let directors = item.folded_directors();
            let mut tokens = HashSet::new();
            tokens.extend(genres.iter().map(|g| format!("g:{}", g)));
            tokens.extend(actors.iter().map(|a| format!("a:{}", a)));
            tokens.extend(directors.iter().map(|d| format!("d:{}", d)));
            catalog.insert(
                item.id,
                CatalogEntry {
                    genres,
                    actors,
                    directors,
                    year: item.year,
                    tokens,
                },
            );
        }

        ensure_active(ctx)?;

        // Every positive interaction adds its confidence to each profile
        // token of the item.
        let mut profiles: HashMap<UserId, Profile> = HashMap::new();
        for interaction in interactions {
            if !interaction.is_usable(self.config.min_confidence) {
                continue;
            }
            let Some(entry) = catalog.get(&interaction.item_id) else {
                continue;
            };
            let profile = profiles.entry(interaction.user_id).or_default();
            for genre in &entry.genres {
                *profile.genres.entry(genre.clone()).or_insert(0.0) += interaction.confidence;
            }
            for actor in &entry.actors {
                *profile.actors.entry(actor.clone()).or_insert(0.0) += interaction.confidence;
            }
            for director in &entry.directors {
                *profile.directors.entry(director.clone()).or_insert(0.0) +=
                    interaction.confidence;
            }
            if let Some(year) = entry.year {
                profile.year_sum += f64::from(year) * interaction.confidence;
                profile.year_weight += interaction.confidence;
            }
        }
        for profile in profiles.values_mut() {
            profile.l1_normalize();
        }

        // Renormalize category weights to sum to one.
        let total = self.config.genre_weight
            + self.config.actor_weight
            + self.config.director_weight
            + self.config.year_weight;
        let weights = if total > 0.0 {
            (
                self.config.genre_weight / total,
                self.config.actor_weight / total,
                self.config.director_weight / total,
                self.config.year_weight / total,
            )
        } else {
            (0.25, 0.25, 0.25, 0.25)
        };

        info!(
            users = profiles.len(),
            items = catalog.len(),
            "content-based training finished"
        );
        slot.install(ContentModel {
            profiles,
            catalog,
            weights,
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
        let Some(profile) = model.profiles.get(&user_id) else {
            return Ok(ScoreMap::new());
        };

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            let Some(entry) = model.catalog.get(&candidate) else {
                continue;
            };
            let score = self.score_item(model, profile, entry);
            if score > 0.0 {
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
        let Some(probe) = model.catalog.get(&item_id) else {
            return Ok(ScoreMap::new());
        };

        let mut scores = ScoreMap::new();
        for &candidate in candidates {
            if candidate == item_id {
                continue;
            }
            let Some(entry) = model.catalog.get(&candidate) else {
                continue;
            };
            let similarity = jaccard(&probe.tokens, &entry.tokens);
            if similarity > 0.0 {
                scores.insert(candidate, similarity);
            }
        }
        normalize_scores(&mut scores);
        Ok(scores)
    }
}
