//! Contract properties every algorithm must satisfy: score range, the
//! equal-score convention, self-exclusion, and empty-not-error semantics.

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use windrose_recommend::prelude::*;

fn training_interactions() -> Vec<Interaction> {
    let t0 = Utc::now() - Duration::days(3);
    let mut out = Vec::new();
    for user in 1..=5 {
        out.push(Interaction::at(user, 10, 0.9, t0 + Duration::minutes(user as i64)));
        out.push(Interaction::at(
            user,
            11,
            0.8,
            t0 + Duration::minutes(user as i64 + 10),
        ));
        out.push(Interaction::at(
            user,
            12,
            0.7,
            t0 + Duration::minutes(user as i64 + 20),
        ));
    }
    for user in 6..=8 {
        out.push(Interaction::at(user, 20, 0.9, t0 + Duration::hours(1)));
        out.push(Interaction::at(
            user,
            21,
            0.9,
            t0 + Duration::hours(1) + Duration::minutes(15),
        ));
    }
    out
}

fn catalog() -> Vec<Item> {
    (10..=21)
        .map(|id| Item {
            id,
            genres: vec![if id < 20 { "sci-fi".into() } else { "romance".into() }],
            actors: vec![format!("actor-{}", id % 3)],
            directors: vec!["d. lane".into()],
            year: Some(2000 + (id as i32 % 20)),
            rating: Some(7.0),
        })
        .collect()
}

#[tokio::test]
async fn scores_stay_in_unit_interval() {
    let recommender = Recommender::new();
    let ctx = CancellationToken::new();
    recommender
        .train_all(&ctx, &training_interactions(), &catalog())
        .await
        .unwrap();

    let candidates: Vec<ItemId> = (10..=21).collect();
    for name in recommender.names() {
        let scores = recommender.predict(&ctx, name, 1, &candidates).await.unwrap();
        for (item, score) in &scores {
            assert!(
                (0.0..=1.0).contains(score),
                "{}: score {} for item {} out of range",
                name,
                score,
                item
            );
        }

        let similar = recommender
            .predict_similar(&ctx, name, 10, &candidates)
            .await
            .unwrap();
        for (item, score) in &similar {
            assert!(
                (0.0..=1.0).contains(score),
                "{}: similar score {} for item {} out of range",
                name,
                score,
                item
            );
        }
    }
}

#[tokio::test]
async fn similar_items_never_include_probe() {
    let recommender = Recommender::new();
    let ctx = CancellationToken::new();
    recommender
        .train_all(&ctx, &training_interactions(), &catalog())
        .await
        .unwrap();

    let candidates: Vec<ItemId> = (10..=21).collect();
    for name in recommender.names() {
        let similar = recommender
            .predict_similar(&ctx, name, 10, &candidates)
            .await
            .unwrap();
        assert!(
            !similar.contains_key(&10),
            "{}: probe item leaked into similar results",
            name
        );
    }
}

#[tokio::test]
async fn untrained_models_answer_empty() {
    let recommender = Recommender::new();
    let ctx = CancellationToken::new();

    for name in recommender.names() {
        let scores = recommender.predict(&ctx, name, 1, &[10, 11]).await.unwrap();
        assert!(scores.is_empty(), "{}: untrained predict was non-empty", name);
        let similar = recommender
            .predict_similar(&ctx, name, 10, &[11])
            .await
            .unwrap();
        assert!(
            similar.is_empty(),
            "{}: untrained similar was non-empty",
            name
        );
    }
}

#[tokio::test]
async fn equal_scores_collapse_to_half() {
    // Popularity over two equally popular items: equal raw mass, two
    // entries, both normalize to 0.5.
    let popularity = Popularity::default();
    let ctx = CancellationToken::new();
    let interactions = vec![
        Interaction::new(1, 10, 0.8),
        Interaction::new(2, 11, 0.8),
    ];
    popularity.train(&ctx, &interactions, &[]).await.unwrap();

    let scores = popularity.predict(&ctx, 99, &[10, 11]).await.unwrap();
    assert_eq!(scores.len(), 2);
    for score in scores.values() {
        assert!((score - 0.5).abs() < 1e-12);
    }
}

#[tokio::test]
async fn versions_track_training_rounds() {
    let recommender = Recommender::new();
    let ctx = CancellationToken::new();
    let interactions = training_interactions();

    recommender
        .train_all(&ctx, &interactions, &catalog())
        .await
        .unwrap();
    recommender
        .train_all(&ctx, &interactions, &catalog())
        .await
        .unwrap();

    for name in recommender.names() {
        let algorithm = recommender.get(name).unwrap();
        assert_eq!(algorithm.version().await, 2, "{}: version mismatch", name);
        assert!(algorithm.is_trained().await);
        assert!(algorithm.last_trained_at().await.is_some());
    }
}
