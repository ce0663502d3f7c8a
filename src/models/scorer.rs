//! Dot-product scoring of user and item embeddings.
//!
//! The raw dot product is the affinity signal for both the training loss
//! and ranking; no normalization is applied.
use wyrm::nn::losses::sparse_categorical_crossentropy;
use wyrm::{Arr, BoxedNode, Variable};

/// Score a single user embedding against a single item embedding.
pub fn score(user: &[f32], item: &[f32]) -> f32 {
    wyrm::simd_dot(user, item)
}

/// Score `user` against every row of `items`.
pub fn score_rows(user: &[f32], items: &Arr) -> Vec<f32> {
    items
        .genrows()
        .into_iter()
        .map(|item| match item.as_slice() {
            Some(item) => score(user, item),
            None => score(user, &item.to_vec()),
        })
        .collect()
}

/// Score matched rows: the i-th user against the i-th item.
pub fn score_pairs(users: &Arr, items: &Arr) -> Vec<f32> {
    izip!(users.genrows(), items.genrows())
        .map(|(user, item)| user.dot(&item))
        .collect()
}

/// The `[B x B]` matrix of scores between every user and every item of a
/// minibatch, as a node of the autodiff graph the embeddings belong to.
pub fn in_batch_logits(users: &Variable<BoxedNode>, items: &Variable<BoxedNode>) -> Variable<BoxedNode> {
    users.dot(&items.t()).boxed()
}

/// In-batch sampled softmax loss, summed over the minibatch rows.
///
/// Row `i` of the `[B x B]` logits is a softmax over every item of the
/// minibatch with column `i` as the positive class. Each row is picked out
/// of the logits with a one-hot `[1 x B]` selector, as the cross-entropy
/// node works on single rows.
///
/// Panics if the minibatch is empty.
pub fn in_batch_softmax_loss(users: &Variable<BoxedNode>, items: &Variable<BoxedNode>) -> Variable<BoxedNode> {
    let logits = in_batch_logits(users, items);
    let batch_size = logits.value().rows();

    let row_losses: Vec<_> = (0..batch_size)
        .map(|row| {
            let mut selector = Arr::zeros((1, batch_size));
            selector[(0, row)] = 1.0;

            let row_logits = wyrm::InputNode::new(selector).dot(&logits).boxed();
            let label = wyrm::IndexInputNode::new(&[row]);

            sparse_categorical_crossentropy(&row_logits, &label).boxed()
        })
        .collect();

    let mut summed_loss = row_losses[0].clone();
    for loss in &row_losses[1..] {
        summed_loss = (summed_loss + loss.clone()).boxed();
    }

    summed_loss
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_symmetric() {
        let u = [0.5, -1.0, 2.0, 0.25];
        let v = [1.5, 3.0, -0.5, 4.0];

        assert_eq!(score(&u, &v), score(&v, &u));
        assert!((score(&u, &v) - (0.75 - 3.0 - 1.0 + 1.0)).abs() < 1e-6);
    }

    #[test]
    fn rows_and_pairs() {
        let items = Arr::from_shape_vec((3, 2), vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let user = [2.0, 3.0];

        assert_eq!(score_rows(&user, &items), vec![2.0, 3.0, 5.0]);

        let users = Arr::from_shape_vec((3, 2), vec![1.0, 1.0, 2.0, 2.0, -1.0, 0.0]).unwrap();
        assert_eq!(score_pairs(&users, &items), vec![1.0, 2.0, -1.0]);
    }

    #[test]
    fn logits_cross_every_pair() {
        let users = wyrm::InputNode::new(
            Arr::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, 2.0]).unwrap(),
        )
        .boxed();
        let items = wyrm::InputNode::new(
            Arr::from_shape_vec((2, 2), vec![3.0, 1.0, 1.0, 1.0]).unwrap(),
        )
        .boxed();

        let logits = in_batch_logits(&users, &items);
        logits.forward();

        let expected = Arr::from_shape_vec((2, 2), vec![3.0, 1.0, 2.0, 2.0]).unwrap();
        assert_eq!(*logits.value(), expected);
    }

    #[test]
    fn softmax_loss_uses_the_diagonal() {
        // Logits [[2, 0], [0, 1]]: row losses ln(1 + e^-2) and ln(1 + e^-1).
        let users = wyrm::InputNode::new(
            Arr::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
        )
        .boxed();
        let items = wyrm::InputNode::new(
            Arr::from_shape_vec((2, 2), vec![2.0, 0.0, 0.0, 1.0]).unwrap(),
        )
        .boxed();

        let loss = in_batch_softmax_loss(&users, &items);
        loss.forward();

        let expected = (1.0 + (-2.0f32).exp()).ln() + (1.0 + (-1.0f32).exp()).ln();
        assert!((loss.value().scalar_sum() - expected).abs() < 1e-5);
    }

    #[test]
    fn softmax_loss_single_row_is_zero() {
        let users = wyrm::InputNode::new(Arr::from_elem((1, 3), 0.5)).boxed();
        let items = wyrm::InputNode::new(Arr::from_elem((1, 3), 2.0)).boxed();

        let loss = in_batch_softmax_loss(&users, &items);
        loss.forward();

        assert!(loss.value().scalar_sum().abs() < 1e-6);
    }
}
