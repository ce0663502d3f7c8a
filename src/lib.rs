#![deny(missing_docs)]
//! # twotower
//!
//! `twotower` implements two-tower retrieval models for implicit feedback:
//! a user tower and an item tower map entity indices (and, optionally,
//! item genre features) into a shared embedding space, and a user's
//! affinity for an item is the dot product of the two embeddings.
//!
//! Two tower architectures are provided:
//!
//! - [`Architecture::Linear`](models/enum.Architecture.html): each tower is a plain
//!   embedding lookup;
//! - [`Architecture::Deep`](models/enum.Architecture.html): the looked-up embedding
//!   (concatenated with genre features on the item side) is passed through a
//!   two-layer feed-forward network.
//!
//! Both are trained with an in-batch sampled softmax: for every user in a
//! minibatch, the items of all the other users in the same minibatch act as
//! negatives.
//!
//! ## Example
//!
//! ```rust
//! # extern crate twotower;
//! use twotower::data::{Interaction, Interactions};
//! use twotower::models::{Architecture, Hyperparameters};
//!
//! let interactions: Vec<Interaction> = (0..40)
//!     .map(|idx| Interaction::new(idx % 8, idx % 5, 1.0, idx))
//!     .collect();
//! let data = Interactions::from(interactions);
//!
//! let model = Hyperparameters::new(data.num_users(), data.num_items())
//!     .architecture(Architecture::Linear)
//!     .embedding_dim(8)
//!     .minibatch_size(4)
//!     .num_epochs(2)
//!     .from_seed([42; 16])
//!     .build();
//!
//! let loss = model.fit(&data.to_triplet(), |_| {}).unwrap();
//! assert!(loss.is_finite());
//!
//! let user = model.user_embedding(0).unwrap();
//! let scores = model.score_all_items(&user).unwrap();
//! assert_eq!(scores.len(), data.num_items());
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate failure;
extern crate ndarray;
extern crate rand;
extern crate rayon;
extern crate serde;
extern crate serde_json;
extern crate siphasher;
extern crate tracing;

extern crate wyrm;

pub mod config;
pub mod data;
pub mod evaluation;
pub mod models;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
pub type ItemId = usize;
/// Alias for timestamps.
pub type Timestamp = usize;

/// Errors raised while encoding entities through a tower.
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum EncodingError {
    /// An entity index lies outside its embedding table.
    #[fail(display = "Index {} is out of bounds for a table of {} rows.", index, bound)]
    IndexOutOfRange {
        /// The offending index.
        index: usize,
        /// Number of rows in the table.
        bound: usize,
    },
    /// A side-feature vector has the wrong width.
    #[fail(display = "Expected side features of width {}, got {}.", expected, actual)]
    DimensionMismatch {
        /// Width the tower was built for.
        expected: usize,
        /// Width that was supplied.
        actual: usize,
    },
    /// The number of side-feature rows does not match the number of indices.
    #[fail(display = "Got {} side-feature rows for {} indices.", features, indices)]
    LengthMismatch {
        /// Number of entity indices.
        indices: usize,
        /// Number of feature rows.
        features: usize,
    },
}

/// Fitting error types.
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum FittingError {
    /// No interactions were given.
    #[fail(display = "No interactions were supplied.")]
    NoInteractions,
    /// The minibatch is empty, ragged, or refers to unknown entities.
    #[fail(display = "Invalid batch: {}", reason)]
    InvalidBatch {
        /// What is wrong with the batch.
        reason: String,
    },
    /// Side features have the wrong width.
    #[fail(display = "Expected side features of width {}, got {}.", expected, actual)]
    DimensionMismatch {
        /// Width the item tower was built for.
        expected: usize,
        /// Width that was supplied.
        actual: usize,
    },
    /// A training run is already active on this model.
    #[fail(display = "A training run is already in progress.")]
    TrainingInProgress,
}

impl From<EncodingError> for FittingError {
    fn from(err: EncodingError) -> Self {
        match err {
            EncodingError::DimensionMismatch { expected, actual } => {
                FittingError::DimensionMismatch { expected, actual }
            }
            other => FittingError::InvalidBatch {
                reason: other.to_string(),
            },
        }
    }
}

/// Prediction error types.
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
    /// The requested entity does not exist.
    #[fail(display = "Index {} is out of bounds for a table of {} rows.", index, bound)]
    InvalidIndex {
        /// The offending index.
        index: usize,
        /// Number of rows in the table.
        bound: usize,
    },
    /// Embedding or feature width does not match the model.
    #[fail(display = "Expected width {}, got {}.", expected, actual)]
    DimensionMismatch {
        /// Width the model expects.
        expected: usize,
        /// Width that was supplied.
        actual: usize,
    },
}

impl From<EncodingError> for PredictionError {
    fn from(err: EncodingError) -> Self {
        match err {
            EncodingError::IndexOutOfRange { index, bound } => {
                PredictionError::InvalidIndex { index, bound }
            }
            EncodingError::DimensionMismatch { expected, actual } => {
                PredictionError::DimensionMismatch { expected, actual }
            }
            EncodingError::LengthMismatch { indices, features } => {
                PredictionError::DimensionMismatch {
                    expected: indices,
                    actual: features,
                }
            }
        }
    }
}

/// Trait describing models that rank items for known users.
pub trait RankingModel {
    /// The representation the model computes for a user.
    type UserRepresentation: std::fmt::Debug;
    /// Compute the representation of user `user_id`.
    fn user_representation(
        &self,
        user_id: UserId,
    ) -> Result<Self::UserRepresentation, PredictionError>;
    /// Given a user representation, score `item_ids` according
    /// to how likely the user is to interact with them.
    fn predict(
        &self,
        user: &Self::UserRepresentation,
        item_ids: &[ItemId],
    ) -> Result<Vec<f32>, PredictionError>;
}
