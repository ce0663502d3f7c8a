//! Towers: encoders mapping entity indices (and optional side
//! features) onto embeddings.
use std::fmt::Debug;
use std::sync::Arc;

use rand::distributions::{Distribution, Normal};
use rand::Rng;

use wyrm::{Arr, BoxedNode, Variable};

use super::embedding::EmbeddingTable;
use crate::EncodingError;

/// Glorot-normal initialization for a `rows x cols` weight matrix that
/// is one block of a layer with the given fan-in and fan-out.
fn dense_init<T: Rng>(rows: usize, cols: usize, fan_in: usize, fan_out: usize, rng: &mut T) -> Arr {
    let normal = Normal::new(0.0, (2.0 / (fan_in + fan_out) as f64).sqrt());
    Arr::zeros((rows, cols)).map(|_| normal.sample(rng) as f32)
}

/// An encoder for one entity type.
pub trait Tower: Debug {
    /// Width of the produced embeddings.
    fn output_dim(&self) -> usize;
    /// Width of the side features the tower consumes (zero if none).
    fn num_features(&self) -> usize;
    /// The base embedding table.
    fn embeddings(&self) -> &EmbeddingTable;
    /// Build the encoding of `indices` as a node of a fresh autodiff graph.
    ///
    /// `features`, when given, holds one side-feature row per index.
    /// Towers that consume side features treat missing features as
    /// all-zero rows; other towers ignore them.
    fn forward(
        &self,
        indices: &[usize],
        features: Option<&[&[f32]]>,
    ) -> Result<Variable<BoxedNode>, EncodingError>;

    /// Number of entities the tower can encode.
    fn num_entities(&self) -> usize {
        self.embeddings().num_rows()
    }

    /// Evaluate the encoding of `indices` as a `[indices.len() x output_dim]`
    /// matrix.
    fn encode(&self, indices: &[usize], features: Option<&[&[f32]]>) -> Result<Arr, EncodingError> {
        let output = self.forward(indices, features)?;
        output.forward();

        let value = Arr::clone(&output.value());
        Ok(value)
    }
}

/// A tower that is a plain embedding lookup.
#[derive(Debug)]
pub struct LinearTower {
    embedding: EmbeddingTable,
}

impl LinearTower {
    /// Build a tower over `num_entities` embeddings of width `dim`.
    pub fn new<R: Rng>(num_entities: usize, dim: usize, rng: &mut R) -> Self {
        LinearTower {
            embedding: EmbeddingTable::new(num_entities, dim, rng),
        }
    }
}

impl Tower for LinearTower {
    fn output_dim(&self) -> usize {
        self.embedding.dim()
    }
    fn num_features(&self) -> usize {
        0
    }
    fn embeddings(&self) -> &EmbeddingTable {
        &self.embedding
    }
    fn forward(
        &self,
        indices: &[usize],
        _features: Option<&[&[f32]]>,
    ) -> Result<Variable<BoxedNode>, EncodingError> {
        self.embedding.lookup(indices)
    }
}

/// Weights and bias of a fully-connected layer.
#[derive(Debug)]
struct Dense {
    weights: Arc<wyrm::HogwildParameter>,
    biases: Arc<wyrm::HogwildParameter>,
}

impl Dense {
    fn new<R: Rng>(input_dim: usize, output_dim: usize, rng: &mut R) -> Self {
        Dense {
            weights: Arc::new(wyrm::HogwildParameter::new(dense_init(
                input_dim, output_dim, input_dim, output_dim, rng,
            ))),
            biases: Arc::new(wyrm::HogwildParameter::new(Arr::zeros((1, output_dim)))),
        }
    }
}

/// A tower that passes the looked-up embedding through a two-layer
/// feed-forward network:
///
/// ```text
/// h = relu([e | f] W_1 + b_1)    (width 2d)
/// o = h W_2 + b_2                (width d)
/// ```
///
/// where `e` is the base embedding and `f` the optional side features.
/// `W_1` is stored as two blocks, one for `e` and one for `f`, so that
/// `[e | f] W_1 = e W_e + f W_f`; both blocks are drawn with the fan-in
/// of the full concatenated input.
#[derive(Debug)]
pub struct DeepTower {
    embedding: EmbeddingTable,
    num_features: usize,
    hidden: Dense,
    feature_weights: Option<Arc<wyrm::HogwildParameter>>,
    output: Dense,
}

impl DeepTower {
    /// Build a tower over `num_entities` embeddings of width `dim`,
    /// consuming `num_features` side features (zero for none).
    pub fn new<R: Rng>(num_entities: usize, dim: usize, num_features: usize, rng: &mut R) -> Self {
        let hidden_dim = 2 * dim;
        let fan_in = dim + num_features;

        let embedding = EmbeddingTable::new(num_entities, dim, rng);
        let hidden = Dense {
            weights: Arc::new(wyrm::HogwildParameter::new(dense_init(
                dim, hidden_dim, fan_in, hidden_dim, rng,
            ))),
            biases: Arc::new(wyrm::HogwildParameter::new(Arr::zeros((1, hidden_dim)))),
        };
        let feature_weights = if num_features > 0 {
            Some(Arc::new(wyrm::HogwildParameter::new(dense_init(
                num_features,
                hidden_dim,
                fan_in,
                hidden_dim,
                rng,
            ))))
        } else {
            None
        };
        let output = Dense::new(hidden_dim, dim, rng);

        DeepTower {
            embedding,
            num_features,
            hidden,
            feature_weights,
            output,
        }
    }

    fn feature_matrix(
        &self,
        num_rows: usize,
        features: Option<&[&[f32]]>,
    ) -> Result<Arr, EncodingError> {
        let mut matrix = Arr::zeros((num_rows, self.num_features));

        if let Some(rows) = features {
            if rows.len() != num_rows {
                return Err(EncodingError::LengthMismatch {
                    indices: num_rows,
                    features: rows.len(),
                });
            }

            for (row_idx, row) in rows.iter().enumerate() {
                if row.len() != self.num_features {
                    return Err(EncodingError::DimensionMismatch {
                        expected: self.num_features,
                        actual: row.len(),
                    });
                }
                for (col_idx, &value) in row.iter().enumerate() {
                    matrix[(row_idx, col_idx)] = value;
                }
            }
        }

        Ok(matrix)
    }
}

impl Tower for DeepTower {
    fn output_dim(&self) -> usize {
        self.embedding.dim()
    }
    fn num_features(&self) -> usize {
        self.num_features
    }
    fn embeddings(&self) -> &EmbeddingTable {
        &self.embedding
    }
    fn forward(
        &self,
        indices: &[usize],
        features: Option<&[&[f32]]>,
    ) -> Result<Variable<BoxedNode>, EncodingError> {
        let embeddings = self.embedding.lookup(indices)?;

        // Biases enter as ones . b so that they repeat over the batch rows.
        let ones = wyrm::InputNode::new(Arr::from_elem((indices.len(), 1), 1.0));

        let hidden_weights = wyrm::ParameterNode::shared(self.hidden.weights.clone());
        let hidden_biases = wyrm::ParameterNode::shared(self.hidden.biases.clone());
        let projected = embeddings.dot(&hidden_weights);
        let hidden_bias = ones.dot(&hidden_biases);

        let pre_activation = match self.feature_weights {
            Some(ref feature_weights) => {
                let side = wyrm::InputNode::new(self.feature_matrix(indices.len(), features)?);
                let feature_weights = wyrm::ParameterNode::shared(feature_weights.clone());

                (projected + side.dot(&feature_weights) + hidden_bias).boxed()
            }
            None => (projected + hidden_bias).boxed(),
        };
        let hidden = pre_activation.relu();

        let output_weights = wyrm::ParameterNode::shared(self.output.weights.clone());
        let output_biases = wyrm::ParameterNode::shared(self.output.biases.clone());

        Ok((hidden.dot(&output_weights) + ones.dot(&output_biases)).boxed())
    }
}
