//! Models module.
pub mod embedding;
pub mod scorer;
pub mod tower;
pub mod two_tower;

pub use self::two_tower::{Hyperparameters, TrainingProgress, TwoTowerModel};

/// The user representation used by two-tower models.
#[derive(Clone, Debug)]
pub struct ImplicitUser {
    user_embedding: Vec<f32>,
}

impl ImplicitUser {
    /// The user embedding.
    pub fn embedding(&self) -> &[f32] {
        &self.user_embedding
    }
}

/// Tower architecture.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Architecture {
    /// Plain embedding lookups, scored by dot product.
    Linear,
    /// Embedding lookups followed by a two-layer feed-forward network;
    /// the item tower additionally consumes genre features.
    Deep,
}
