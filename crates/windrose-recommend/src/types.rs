//! Input records consumed by every recommendation algorithm.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User identifier.
pub type UserId = i64;

/// Item identifier.
pub type ItemId = i64;

/// How a user engaged with an item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Completed,
    Engaged,
    /// Started and walked away. Ignored wherever positive-only signal is
    /// needed.
    Abandoned,
}

/// One observed (user, item) event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: UserId,
    pub item_id: ItemId,

    /// Engagement strength in (0, 1].
    pub confidence: f64,

    pub timestamp: Option<DateTime<Utc>>,
    pub interaction_type: Option<InteractionType>,
}

impl Interaction {
    /// Shorthand constructor used heavily in tests.
    pub fn new(user_id: UserId, item_id: ItemId, confidence: f64) -> Self {
        Self {
            user_id,
            item_id,
            confidence,
            timestamp: None,
            interaction_type: None,
        }
    }

    /// Same, with a timestamp.
    pub fn at(user_id: UserId, item_id: ItemId, confidence: f64, ts: DateTime<Utc>) -> Self {
        Self {
            user_id,
            item_id,
            confidence,
            timestamp: Some(ts),
            interaction_type: None,
        }
    }

    /// Whether this event counts as positive signal.
    pub fn is_positive(&self) -> bool {
        self.interaction_type != Some(InteractionType::Abandoned)
    }

    /// Whether this event clears the configured confidence floor and is
    /// positive. Anything below the floor is treated as absent.
    pub fn is_usable(&self, min_confidence: f64) -> bool {
        self.is_positive() && self.confidence >= min_confidence
    }
}

/// Catalog entry with content attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub genres: Vec<String>,
    pub actors: Vec<String>,
    pub directors: Vec<String>,
    pub year: Option<i32>,
    pub rating: Option<f64>,
}

impl Item {
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Genres, case-folded for comparison.
    pub fn folded_genres(&self) -> Vec<String> {
        fold(&self.genres)
    }

    /// Actors, case-folded for comparison.
    pub fn folded_actors(&self) -> Vec<String> {
        fold(&self.actors)
    }

    /// Directors, case-folded for comparison.
    pub fn folded_directors(&self) -> Vec<String> {
        fold(&self.directors)
    }
}

fn fold(tokens: &[String]) -> Vec<String> {
    tokens
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_floor() {
        let low = Interaction::new(1, 10, 0.05);
        let high = Interaction::new(1, 10, 0.8);
        assert!(!low.is_usable(0.1));
        assert!(high.is_usable(0.1));
    }

    #[test]
    fn test_abandoned_is_not_positive() {
        let mut i = Interaction::new(1, 10, 0.9);
        i.interaction_type = Some(InteractionType::Abandoned);
        assert!(!i.is_positive());
        assert!(!i.is_usable(0.0));
    }

    #[test]
    fn test_token_folding() {
        let item = Item {
            id: 1,
            genres: vec!["Sci-Fi".to_string(), "  Drama ".to_string()],
            ..Item::default()
        };
        assert_eq!(item.folded_genres(), vec!["sci-fi", "drama"]);
    }
}
