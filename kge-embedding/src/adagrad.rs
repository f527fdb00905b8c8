use crate::{cross_rel::CrossRelPartition, table::EmbeddingTable};
use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use tracing::debug;

pub const ADAGRAD_EPS: f32 = 1e-10;

/// Row-sparse Adagrad: no momentum, no weight decay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparseAdagrad {
    lr: f32,
}

impl SparseAdagrad {
    pub fn new(lr: f32) -> Result<Self> {
        if !lr.is_finite() || lr <= 0.0 {
            return Err(anyhow!("Learning rate must be positive and finite, got {}", lr));
        }
        Ok(Self { lr })
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Applies one gradient batch to `table`.
    ///
    /// With a cross-relation partition, the overflow rows in the batch are
    /// first applied to the authoritative overflow table, then the whole batch
    /// (mirror rows included) is applied to `table`.
    pub fn apply(
        &self,
        table: &EmbeddingTable,
        partition: Option<&CrossRelPartition>,
        indices: &[usize],
        grads: ArrayView2<f32>,
    ) -> Result<()> {
        if grads.nrows() != indices.len() {
            return Err(anyhow!(
                "Got {} gradient rows for {} indices",
                grads.nrows(),
                indices.len()
            ));
        }
        if grads.ncols() != table.dim() {
            return Err(anyhow!(
                "Gradient dimension {} does not match table dimension {}",
                grads.ncols(),
                table.dim()
            ));
        }
        if grads.iter().any(|g| !g.is_finite()) {
            return Err(anyhow!(
                "Gradient of shape {:?} contains non-finite values",
                grads.dim()
            ));
        }
        table.check_indices(indices)?;
        let grad_sq = grad_sq_mean(grads);

        if let Some(partition) = partition {
            let positions = partition.overflow_positions(indices);
            if !positions.is_empty() {
                let overflow_indices: Vec<usize> = positions.iter().map(|&p| indices[p]).collect();
                let overflow_grads = grads.select(Axis(0), &positions);
                let overflow_sq = grad_sq.select(Axis(0), &positions);
                debug!(rows = positions.len(), "applying overflow rows to authoritative table");
                self.apply_rows(
                    partition.authoritative(),
                    &overflow_indices,
                    overflow_grads.view(),
                    overflow_sq.view(),
                )?;
            }
        }
        self.apply_rows(table, indices, grads, grad_sq.view())
    }

    fn apply_rows(
        &self,
        table: &EmbeddingTable,
        indices: &[usize],
        grads: ArrayView2<f32>,
        grad_sq: ArrayView1<f32>,
    ) -> Result<()> {
        table.accumulate(indices, grad_sq);
        let std: Array1<f32> = indices
            .iter()
            .map(|&i| table.accumulator_value(i).sqrt() + ADAGRAD_EPS)
            .collect();
        let mut delta = Array2::<f32>::zeros(grads.raw_dim());
        let lr = self.lr;
        Zip::from(delta.rows_mut())
            .and(grads.rows())
            .and(&std)
            .par_for_each(|mut d, g, &s| {
                Zip::from(&mut d).and(&g).for_each(|d, &g| *d = -lr * g / s);
            });
        table.scatter_add(indices, delta.view())
    }
}

/// Mean over the embedding dimension of `g * g`, one value per row.
pub fn grad_sq_mean(grads: ArrayView2<f32>) -> Array1<f32> {
    let dim = grads.ncols().max(1) as f32;
    grads.map_axis(Axis(1), |row| row.iter().map(|g| g * g).sum::<f32>() / dim)
}
