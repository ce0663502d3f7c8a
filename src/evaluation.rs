//! Ranking metrics.
use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use super::{ItemId, PredictionError, RankingModel, UserId};
use crate::data::Interactions;

fn group_by_user(interactions: &Interactions) -> HashMap<UserId, Vec<ItemId>> {
    let mut grouped: HashMap<UserId, Vec<ItemId>> = HashMap::new();

    for interaction in interactions.data() {
        grouped
            .entry(interaction.user_id())
            .or_insert_with(Vec::new)
            .push(interaction.item_id());
    }

    grouped
}

/// Mean reciprocal rank of the `test` interactions.
///
/// Every user with test interactions is scored against all items; items
/// the user interacted with in `train` are excluded from the ranking.
/// Test items that also appear in the user's training interactions are
/// skipped. Returns zero if there is nothing to rank.
pub fn mrr_score<T: RankingModel>(
    model: &T,
    train: &Interactions,
    test: &Interactions,
) -> Result<f32, PredictionError> {
    let item_ids: Vec<ItemId> = (0..test.num_items()).collect();
    let train_items = group_by_user(train);
    let empty = Vec::new();

    let mut users = Vec::new();

    for (user_id, test_items) in group_by_user(test) {
        let user = model.user_representation(user_id)?;
        let mut predictions = model.predict(&user, &item_ids)?;

        let seen: HashSet<ItemId> = train_items
            .get(&user_id)
            .unwrap_or(&empty)
            .iter()
            .cloned()
            .collect();

        for &train_item_id in &seen {
            if let Some(prediction) = predictions.get_mut(train_item_id) {
                *prediction = std::f32::MIN;
            }
        }

        let test_items: Vec<ItemId> = test_items
            .into_iter()
            .filter(|item_id| !seen.contains(item_id))
            .collect();

        users.push((predictions, test_items));
    }

    let reciprocal_ranks: Vec<f32> = users
        .par_iter()
        .flat_map(|(predictions, test_items)| {
            test_items
                .par_iter()
                .map(move |&test_item| {
                    let test_score = predictions[test_item];
                    let rank = predictions
                        .iter()
                        .filter(|&&prediction| prediction >= test_score)
                        .count();

                    1.0 / rank as f32
                })
        })
        .collect();

    if reciprocal_ranks.is_empty() {
        return Ok(0.0);
    }

    Ok(reciprocal_ranks.iter().sum::<f32>() / reciprocal_ranks.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Interaction;

    /// Scores items by closeness of their id to the user id.
    struct Oracle;

    impl RankingModel for Oracle {
        type UserRepresentation = UserId;
        fn user_representation(&self, user_id: UserId) -> Result<UserId, PredictionError> {
            Ok(user_id)
        }
        fn predict(&self, user: &UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
            Ok(item_ids
                .iter()
                .map(|&item| -((item as f32) - (*user as f32)).abs())
                .collect())
        }
    }

    #[test]
    fn perfect_ranking() {
        let test = Interactions::from(vec![
            Interaction::new(0, 0, 1.0, 0),
            Interaction::new(3, 3, 1.0, 0),
            Interaction::new(5, 5, 1.0, 0),
        ]);
        let train = Interactions::new(6, 6);

        assert_eq!(mrr_score(&Oracle, &train, &test).unwrap(), 1.0);
    }

    #[test]
    fn train_items_are_excluded() {
        // User 2 would rank item 2 first, then items 1 and 3; with item 2
        // seen in training, item 3 ties for first place with item 1.
        let test = Interactions::from(vec![Interaction::new(2, 3, 1.0, 0)]);
        let train = Interactions::from(vec![Interaction::new(2, 2, 1.0, 0)]);

        assert_eq!(mrr_score(&Oracle, &train, &test).unwrap(), 0.5);
    }

    #[test]
    fn nothing_to_rank() {
        let data = Interactions::from(vec![Interaction::new(1, 1, 1.0, 0)]);

        assert_eq!(mrr_score(&Oracle, &data, &data).unwrap(), 0.0);
    }
}
