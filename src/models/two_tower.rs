//! Two-tower model trained with an in-batch sampled softmax.
//!
//! Every training step encodes the minibatch users with the user tower and
//! the minibatch items with the item tower, forms the `[B x B]` matrix of
//! user-item dot products, and applies a softmax cross-entropy loss to each
//! row with the diagonal entry as the positive class. The items of the other
//! users in the minibatch thus serve as negatives.
//!
//! If the same item appears more than once in a minibatch, each occurrence
//! is a separate column; a user paired with one occurrence sees the others
//! as negatives even though they are the same item. This weakens the
//! negatives slightly and is left as is.
//!
//! Each step builds its own autodiff graph over the shared parameters and
//! drops it when the step ends, so intermediate matrices never outlive the
//! step that created them.
use std::cell::{Cell, RefCell};
use std::fmt;

use rand::{Rng, SeedableRng, XorShiftRng};

use tracing::{debug, info, warn};

use wyrm::optim::{Adam, Optimizer};
use wyrm::Arr;

use super::embedding::EmbeddingTable;
use super::scorer;
use super::tower::{DeepTower, LinearTower, Tower};
use super::{Architecture, ImplicitUser};
use crate::config::TrainingConfig;
use crate::data::{ItemFeatures, TripletInteractions, NUM_GENRES};
use crate::{FittingError, ItemId, PredictionError, RankingModel, UserId};

/// Hyperparameters describing the two-tower model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    num_users: usize,
    num_items: usize,
    architecture: Architecture,
    embedding_dim: usize,
    num_features: usize,
    learning_rate: f32,
    minibatch_size: usize,
    num_epochs: usize,
    inference_chunk_size: usize,
    rng: XorShiftRng,
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Hyperparameters {
            num_users,
            num_items,
            architecture: Architecture::Linear,
            embedding_dim: 32,
            num_features: NUM_GENRES,
            learning_rate: 0.001,
            minibatch_size: 64,
            num_epochs: 5,
            inference_chunk_size: 100,
            rng: XorShiftRng::from_seed(rand::thread_rng().gen()),
        }
    }

    /// Build hyperparameters from a training configuration.
    pub fn from_config(num_users: usize, num_items: usize, config: &TrainingConfig) -> Self {
        Hyperparameters::new(num_users, num_items)
            .embedding_dim(config.embedding_dim)
            .minibatch_size(config.batch_size)
            .num_epochs(config.epochs)
            .learning_rate(config.learning_rate)
    }

    /// Set the tower architecture.
    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    /// Set the embedding dimensionality.
    pub fn embedding_dim(mut self, embedding_dim: usize) -> Self {
        self.embedding_dim = embedding_dim;
        self
    }

    /// Set the width of the item side features consumed by the deep
    /// item tower.
    pub fn num_features(mut self, num_features: usize) -> Self {
        self.num_features = num_features;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the minibatch size.
    pub fn minibatch_size(mut self, minibatch_size: usize) -> Self {
        self.minibatch_size = minibatch_size;
        self
    }

    /// Set the number of epochs to run per each `fit` call.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set how many items are encoded at once when scoring all items.
    pub fn inference_chunk_size(mut self, inference_chunk_size: usize) -> Self {
        self.inference_chunk_size = inference_chunk_size;
        self
    }

    /// Set the random number generator.
    pub fn rng(mut self, rng: XorShiftRng) -> Self {
        self.rng = rng;
        self
    }

    /// Set the random number generator from seed.
    pub fn from_seed(mut self, seed: [u8; 16]) -> Self {
        self.rng = XorShiftRng::from_seed(seed);
        self
    }

    // Moment decay rates and epsilon are left at wyrm's defaults.
    fn build_optimizer(&self) -> Adam {
        Adam::new().learning_rate(self.learning_rate)
    }

    /// Build the two-tower model.
    pub fn build(mut self) -> TwoTowerModel {
        let user_tower: Box<dyn Tower> = match self.architecture {
            Architecture::Linear => Box::new(LinearTower::new(
                self.num_users,
                self.embedding_dim,
                &mut self.rng,
            )),
            Architecture::Deep => Box::new(DeepTower::new(
                self.num_users,
                self.embedding_dim,
                0,
                &mut self.rng,
            )),
        };
        let item_tower: Box<dyn Tower> = match self.architecture {
            Architecture::Linear => Box::new(LinearTower::new(
                self.num_items,
                self.embedding_dim,
                &mut self.rng,
            )),
            Architecture::Deep => Box::new(DeepTower::new(
                self.num_items,
                self.embedding_dim,
                self.num_features,
                &mut self.rng,
            )),
        };

        let optimizer = self.build_optimizer();
        let rng = RefCell::new(XorShiftRng::from_seed(self.rng.gen()));

        TwoTowerModel {
            zero_features: vec![0.0; item_tower.num_features()],
            hyper: self,
            user_tower,
            item_tower,
            item_features: None,
            optimizer,
            rng,
            num_steps: Cell::new(0),
            loss_history: RefCell::new(Vec::new()),
            training: Cell::new(false),
        }
    }
}

/// Progress report passed to the `fit` hook after every step.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingProgress {
    /// Zero-based epoch.
    pub epoch: usize,
    /// Zero-based minibatch within the epoch.
    pub batch: usize,
    /// Number of minibatches per epoch.
    pub num_batches: usize,
    /// Loss of the step that just completed.
    pub loss: f32,
}

/// Marks a training run as active for as long as it is alive.
struct TrainingGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> TrainingGuard<'a> {
    fn acquire(flag: &'a Cell<bool>) -> Result<Self, FittingError> {
        if flag.replace(true) {
            Err(FittingError::TrainingInProgress)
        } else {
            Ok(TrainingGuard { flag })
        }
    }
}

impl<'a> Drop for TrainingGuard<'a> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Two-tower model: a user tower and an item tower whose embeddings are
/// scored by dot product.
pub struct TwoTowerModel {
    hyper: Hyperparameters,
    user_tower: Box<dyn Tower>,
    item_tower: Box<dyn Tower>,
    item_features: Option<ItemFeatures>,
    zero_features: Vec<f32>,
    optimizer: Adam,
    rng: RefCell<XorShiftRng>,
    num_steps: Cell<usize>,
    loss_history: RefCell<Vec<f32>>,
    training: Cell<bool>,
}

impl fmt::Debug for TwoTowerModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TwoTowerModel")
            .field("hyper", &self.hyper)
            .field("user_tower", &self.user_tower)
            .field("item_tower", &self.item_tower)
            .field("item_features", &self.item_features)
            .field("num_steps", &self.num_steps.get())
            .field("training", &self.training.get())
            .finish()
    }
}

impl TwoTowerModel {
    /// Attach item side features. They are looked up for every item the
    /// model encodes; items without a row get all-zero features.
    ///
    /// Fails with `DimensionMismatch` if the features are not as wide as
    /// the item tower expects. Towers without side features accept and
    /// ignore any width.
    pub fn with_item_features(mut self, features: ItemFeatures) -> Result<Self, FittingError> {
        let expected = self.item_tower.num_features();

        if expected > 0 && features.num_features() != expected {
            return Err(FittingError::DimensionMismatch {
                expected,
                actual: features.num_features(),
            });
        }

        self.item_features = Some(features);

        Ok(self)
    }

    /// The hyperparameters the model was built with.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Tower architecture.
    pub fn architecture(&self) -> Architecture {
        self.hyper.architecture
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.user_tower.num_entities()
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.item_tower.num_entities()
    }

    /// Embedding dimensionality.
    pub fn embedding_dim(&self) -> usize {
        self.user_tower.output_dim()
    }

    /// The user embedding table.
    pub fn user_embeddings(&self) -> &EmbeddingTable {
        self.user_tower.embeddings()
    }

    /// The item embedding table.
    pub fn item_embeddings_table(&self) -> &EmbeddingTable {
        self.item_tower.embeddings()
    }

    /// Number of optimizer steps taken so far. Every parameter takes part
    /// in every step, so this equals the iteration count Adam keeps for
    /// each parameter's moment estimates.
    pub fn num_steps(&self) -> usize {
        self.num_steps.get()
    }

    /// The loss of every step taken so far, in order.
    pub fn loss_history(&self) -> Vec<f32> {
        self.loss_history.borrow().clone()
    }

    /// Whether a `fit` call is currently running.
    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Side features for `item_ids` from the attached feature table, with
    /// zero rows for unknown items. `None` if no table is attached.
    fn lookup_features(&self, item_ids: &[ItemId]) -> Option<Vec<&[f32]>> {
        self.item_features.as_ref().map(|features| {
            item_ids
                .iter()
                .map(|&item_id| features.get(item_id).unwrap_or(&self.zero_features))
                .collect()
        })
    }

    /// Run one optimization step on a minibatch of (user, item) pairs and
    /// return its loss, averaged over the minibatch.
    ///
    /// `item_features`, if given, holds one side-feature row per item;
    /// otherwise the attached feature table is used. Towers without side
    /// features ignore both. The step either fails
    /// before touching any parameter or applies a full update.
    pub fn train_step(
        &self,
        user_ids: &[UserId],
        item_ids: &[ItemId],
        item_features: Option<&[&[f32]]>,
    ) -> Result<f32, FittingError> {
        if user_ids.is_empty() {
            return Err(FittingError::InvalidBatch {
                reason: "empty batch".to_owned(),
            });
        }
        if user_ids.len() != item_ids.len() {
            return Err(FittingError::InvalidBatch {
                reason: format!(
                    "{} users but {} items",
                    user_ids.len(),
                    item_ids.len()
                ),
            });
        }

        let batch_size = user_ids.len();

        let attached = match item_features {
            Some(_) => None,
            None => self.lookup_features(item_ids),
        };
        let item_features = item_features.or_else(|| attached.as_ref().map(|rows| &rows[..]));

        let users = self.user_tower.forward(user_ids, None)?;
        let items = self.item_tower.forward(item_ids, item_features)?;

        let mut loss = scorer::in_batch_softmax_loss(&users, &items);

        loss.forward();
        loss.backward(1.0 / batch_size as f32);

        let loss_value = loss.value().scalar_sum() / batch_size as f32;

        self.optimizer.step(loss.parameters());

        self.num_steps.set(self.num_steps.get() + 1);
        self.loss_history.borrow_mut().push(loss_value);

        if !loss_value.is_finite() {
            warn!(step = self.num_steps.get(), "Non-finite training loss");
        }
        debug!(step = self.num_steps.get(), batch_size, loss = loss_value, "Training step");

        Ok(loss_value)
    }

    /// Fit the model, running the configured number of epochs over
    /// `interactions`.
    ///
    /// Every epoch visits the interactions in a fresh random order, in
    /// minibatches of the configured size (the last one may be shorter).
    /// `hook` is called after every step. Returns the mean minibatch loss
    /// of the final epoch.
    ///
    /// Fails with `TrainingInProgress` if the model is already being
    /// fitted, and aborts on the first failing step.
    pub fn fit<F>(&self, interactions: &TripletInteractions, mut hook: F) -> Result<f32, FittingError>
    where
        F: FnMut(&TrainingProgress),
    {
        let _guard = TrainingGuard::acquire(&self.training)?;

        if interactions.is_empty() {
            return Err(FittingError::NoInteractions);
        }
        if interactions.num_users() > self.num_users() || interactions.num_items() > self.num_items() {
            return Err(FittingError::InvalidBatch {
                reason: format!(
                    "interactions span {} users and {} items, model has {} and {}",
                    interactions.num_users(),
                    interactions.num_items(),
                    self.num_users(),
                    self.num_items()
                ),
            });
        }

        let minibatch_size = self.hyper.minibatch_size.max(1);
        let num_batches = interactions.num_minibatches(minibatch_size);

        let mut epoch_loss = 0.0;

        for epoch in 0..self.hyper.num_epochs {
            let shuffled = interactions.shuffled(&mut *self.rng.borrow_mut());
            let mut loss_sum = 0.0;

            for (batch, minibatch) in shuffled.iter_minibatch(minibatch_size).enumerate() {
                let loss = self.train_step(minibatch.user_ids, minibatch.item_ids, None)?;

                loss_sum += loss;

                hook(&TrainingProgress {
                    epoch,
                    batch,
                    num_batches,
                    loss,
                });
            }

            epoch_loss = loss_sum / num_batches as f32;
            info!(epoch, loss = epoch_loss, "Finished epoch");
        }

        Ok(epoch_loss)
    }

    /// The embedding of user `user_id`.
    pub fn user_embedding(&self, user_id: UserId) -> Result<Vec<f32>, PredictionError> {
        let embedding = self.user_tower.encode(&[user_id], None)?;

        Ok(embedding.iter().cloned().collect())
    }

    /// Score `item_ids` for a user embedding, encoding the items in
    /// chunks of the configured inference chunk size.
    pub fn score_items(&self, user_embedding: &[f32], item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        if user_embedding.len() != self.embedding_dim() {
            return Err(PredictionError::DimensionMismatch {
                expected: self.embedding_dim(),
                actual: user_embedding.len(),
            });
        }

        let mut scores = Vec::with_capacity(item_ids.len());

        for chunk in item_ids.chunks(self.hyper.inference_chunk_size.max(1)) {
            let features = self.lookup_features(chunk);
            let embeddings = self
                .item_tower
                .encode(chunk, features.as_ref().map(|rows| &rows[..]))?;

            scores.extend(scorer::score_rows(user_embedding, &embeddings));
        }

        Ok(scores)
    }

    /// Score every item for a user embedding. The result is indexed by
    /// item id and always has `num_items` entries.
    pub fn score_all_items(&self, user_embedding: &[f32]) -> Result<Vec<f32>, PredictionError> {
        let item_ids: Vec<ItemId> = (0..self.num_items()).collect();

        self.score_items(user_embedding, &item_ids)
    }

    /// The encoded embeddings of all items, one row per item id.
    pub fn item_embeddings(&self) -> Result<Arr, PredictionError> {
        let num_items = self.num_items();
        let dim = self.embedding_dim();
        let item_ids: Vec<ItemId> = (0..num_items).collect();

        let mut embeddings = Arr::zeros((num_items, dim));

        for (chunk_idx, chunk) in item_ids.chunks(self.hyper.inference_chunk_size.max(1)).enumerate() {
            let features = self.lookup_features(chunk);
            let encoded = self
                .item_tower
                .encode(chunk, features.as_ref().map(|rows| &rows[..]))?;
            let offset = chunk_idx * self.hyper.inference_chunk_size.max(1);

            for ((row, col), &value) in encoded.indexed_iter() {
                embeddings[(offset + row, col)] = value;
            }
        }

        Ok(embeddings)
    }

    /// The `k` highest-scoring items for `user_id`, best first, skipping
    /// the items in `exclude`.
    pub fn recommend(
        &self,
        user_id: UserId,
        k: usize,
        exclude: &[ItemId],
    ) -> Result<Vec<(ItemId, f32)>, PredictionError> {
        let user_embedding = self.user_embedding(user_id)?;
        let scores = self.score_all_items(&user_embedding)?;

        let mut ranked: Vec<(ItemId, f32)> = scores
            .into_iter()
            .enumerate()
            .filter(|(item_id, _)| !exclude.contains(item_id))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);

        Ok(ranked)
    }
}

impl RankingModel for TwoTowerModel {
    type UserRepresentation = ImplicitUser;
    fn user_representation(
        &self,
        user_id: UserId,
    ) -> Result<Self::UserRepresentation, PredictionError> {
        Ok(ImplicitUser {
            user_embedding: self.user_embedding(user_id)?,
        })
    }

    fn predict(
        &self,
        user: &Self::UserRepresentation,
        item_ids: &[ItemId],
    ) -> Result<Vec<f32>, PredictionError> {
        self.score_items(&user.user_embedding, item_ids)?
            .into_iter()
            .map(|prediction| {
                if prediction.is_finite() {
                    Ok(prediction)
                } else {
                    Err(PredictionError::InvalidPredictionValue)
                }
            })
            .collect()
    }
}
