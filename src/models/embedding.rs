//! Dense, index-addressed embedding tables.
use std::sync::Arc;

use ndarray::Axis;
use rand::distributions::{Distribution, Normal};
use rand::Rng;

use wyrm::{Arr, BoxedNode, Variable};

use crate::EncodingError;

fn embedding_init<T: Rng>(rows: usize, cols: usize, rng: &mut T) -> wyrm::Arr {
    let normal = Normal::new(0.0, 1.0 / cols as f64);
    Arr::zeros((rows, cols)).map(|_| normal.sample(rng) as f32)
}

/// A fixed-size table mapping entity indices `0..num_rows` onto
/// vectors of width `dim`.
///
/// The values live in a shared `HogwildParameter`: every autodiff graph
/// built over the table reads the same storage, and the optimizer writes
/// its updates back into it. Only rows gathered during a step receive a
/// gradient, so untouched rows keep their values.
#[derive(Debug)]
pub struct EmbeddingTable {
    num_rows: usize,
    dim: usize,
    parameter: Arc<wyrm::HogwildParameter>,
}

impl EmbeddingTable {
    /// Create a table with normally distributed entries.
    pub fn new<R: Rng>(num_rows: usize, dim: usize, rng: &mut R) -> Self {
        EmbeddingTable::from_array(embedding_init(num_rows, dim, rng))
    }

    /// Create a table holding exactly `values`.
    pub fn from_array(values: Arr) -> Self {
        let (num_rows, dim) = values.dim();

        EmbeddingTable {
            num_rows,
            dim,
            parameter: Arc::new(wyrm::HogwildParameter::new(values)),
        }
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Width of every row.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Check that every index addresses a row of the table.
    pub fn check_indices(&self, indices: &[usize]) -> Result<(), EncodingError> {
        match indices.iter().find(|&&idx| idx >= self.num_rows) {
            Some(&index) => Err(EncodingError::IndexOutOfRange {
                index,
                bound: self.num_rows,
            }),
            None => Ok(()),
        }
    }

    /// Copy out the rows at `indices` as a `[indices.len() x dim]`
    /// matrix. Indices may repeat.
    pub fn gather(&self, indices: &[usize]) -> Result<Arr, EncodingError> {
        self.check_indices(indices)?;

        Ok(self.parameter.value().select(Axis(0), indices))
    }

    /// Add a lookup of `indices` to an autodiff graph. Gradients flowing
    /// back through the returned node reach only the gathered rows.
    pub fn lookup(&self, indices: &[usize]) -> Result<Variable<BoxedNode>, EncodingError> {
        self.check_indices(indices)?;

        let table = wyrm::ParameterNode::shared(self.parameter.clone());
        let index = wyrm::IndexInputNode::new(indices);

        Ok(table.index(&index).boxed())
    }

    /// A copy of the whole table.
    pub fn snapshot(&self) -> Arr {
        Arr::clone(&self.parameter.value())
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, XorShiftRng};

    use super::*;

    #[test]
    fn gather_returns_rows() {
        let mut rng = XorShiftRng::from_seed([42; 16]);
        let table = EmbeddingTable::new(10, 4, &mut rng);
        let values = table.snapshot();

        for idx in 0..10 {
            let row = table.gather(&[idx]).unwrap();
            assert_eq!(row.dim(), (1, 4));
            for col in 0..4 {
                assert_eq!(row[(0, col)], values[(idx, col)]);
            }
        }
    }

    #[test]
    fn gather_allows_repeats() {
        let values = Arr::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let table = EmbeddingTable::from_array(values);
        let rows = table.gather(&[1, 0, 1]).unwrap();

        assert_eq!(rows.dim(), (3, 2));
        assert_eq!(rows[(0, 0)], 3.0);
        assert_eq!(rows[(1, 1)], 2.0);
        assert_eq!(rows[(2, 1)], 4.0);
    }

    #[test]
    fn out_of_range_index() {
        let mut rng = XorShiftRng::from_seed([42; 16]);
        let table = EmbeddingTable::new(3, 2, &mut rng);

        assert_eq!(
            table.gather(&[0, 3]).unwrap_err(),
            EncodingError::IndexOutOfRange { index: 3, bound: 3 }
        );
        assert!(table.lookup(&[5]).is_err());
    }

    #[test]
    fn lookup_matches_gather() {
        let mut rng = XorShiftRng::from_seed([42; 16]);
        let table = EmbeddingTable::new(6, 3, &mut rng);

        let node = table.lookup(&[4, 2]).unwrap();
        node.forward();

        assert_eq!(*node.value(), table.gather(&[4, 2]).unwrap());
    }
}
