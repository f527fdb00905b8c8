use crate::{device::Device, shared::SharedRows};
use anyhow::{anyhow, Result};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct EmbeddingTable {
    num_embeddings: usize,
    dim: usize,
    device: Device,
    rows: SharedRows,
    accumulator: SharedRows,
    step: AtomicU64,
}

impl EmbeddingTable {
    pub fn new(num_embeddings: usize, dim: usize, device: Device) -> Result<Self> {
        if dim == 0 {
            return Err(anyhow!("Embedding dimension must be at least 1"));
        }
        let num_values = num_embeddings
            .checked_mul(dim)
            .ok_or_else(|| anyhow!("Table of {} x {} is too large", num_embeddings, dim))?;
        Ok(Self {
            num_embeddings,
            dim,
            device,
            rows: SharedRows::zeroed(num_values)?,
            accumulator: SharedRows::zeroed(num_embeddings)?,
            step: AtomicU64::new(0),
        })
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn step(&self) -> u64 {
        self.step.load(Ordering::Relaxed)
    }

    pub(crate) fn set_step(&self, step: u64) {
        self.step.store(step, Ordering::Relaxed);
    }

    /// Returns the new step count.
    pub fn increment_step(&self) -> u64 {
        self.step.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fills rows uniformly from `[-emb_init, emb_init]` and resets the accumulator.
    pub fn init(&self, emb_init: f32, seed: u64) -> Result<()> {
        if !emb_init.is_finite() || emb_init < 0.0 {
            return Err(anyhow!("emb_init must be non-negative and finite, got {}", emb_init));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..self.rows.len() {
            self.rows.set(i, rng.gen_range(-emb_init..=emb_init));
        }
        self.reset_accumulator();
        Ok(())
    }

    pub fn reset_accumulator(&self) {
        self.accumulator.fill(0.0);
    }

    pub fn check_indices(&self, indices: &[usize]) -> Result<()> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.num_embeddings) {
            return Err(anyhow!(
                "Row index {} out of range for table with {} rows",
                bad,
                self.num_embeddings
            ));
        }
        Ok(())
    }

    fn check_batch(&self, indices: &[usize], values: &ArrayView2<f32>) -> Result<()> {
        let (n, d) = values.dim();
        if n != indices.len() {
            return Err(anyhow!(
                "Got {} rows of values for {} indices",
                n,
                indices.len()
            ));
        }
        if d != self.dim {
            return Err(anyhow!(
                "Got rows of dimension {}, table dimension is {}",
                d,
                self.dim
            ));
        }
        self.check_indices(indices)
    }

    pub fn gather(&self, indices: &[usize]) -> Result<Array2<f32>> {
        self.check_indices(indices)?;
        let mut out = Array2::<f32>::zeros((indices.len(), self.dim));
        for (mut dst, &i) in out.rows_mut().into_iter().zip(indices) {
            let dst = dst
                .as_slice_mut()
                .ok_or_else(|| anyhow!("Gather buffer is not contiguous"))?;
            self.rows.read_into(i * self.dim, dst);
        }
        Ok(out)
    }

    pub fn row(&self, i: usize) -> Result<Vec<f32>> {
        self.check_indices(&[i])?;
        let mut out = vec![0.0; self.dim];
        self.rows.read_into(i * self.dim, &mut out);
        Ok(out)
    }

    pub fn to_array(&self) -> Result<Array2<f32>> {
        Array2::from_shape_vec((self.num_embeddings, self.dim), self.rows.to_vec())
            .map_err(|e| anyhow!("Row buffer does not match table shape: {}", e))
    }

    pub(crate) fn row_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.rows.iter()
    }

    /// Overwrites `rows[indices[k]]` with `values[k]`. Used for load and restore.
    pub fn write_rows(&self, indices: &[usize], values: ArrayView2<f32>) -> Result<()> {
        self.check_batch(indices, &values)?;
        for (src, &i) in values.rows().into_iter().zip(indices) {
            write_row(&self.rows, i * self.dim, src, SharedRows::write_from);
        }
        Ok(())
    }

    /// `rows[indices[k]] += deltas[k]`.
    ///
    /// Indices must be unique within one call; repeated indices race on the
    /// same row and the outcome is unspecified.
    pub fn scatter_add(&self, indices: &[usize], deltas: ArrayView2<f32>) -> Result<()> {
        self.check_batch(indices, &deltas)?;
        for (src, &i) in deltas.rows().into_iter().zip(indices) {
            write_row(&self.rows, i * self.dim, src, SharedRows::add_from);
        }
        Ok(())
    }

    pub fn load_emb(&self, values: ArrayView2<f32>) -> Result<()> {
        if values.dim() != (self.num_embeddings, self.dim) {
            return Err(anyhow!(
                "Cannot load array of shape {:?} into table of shape ({}, {})",
                values.dim(),
                self.num_embeddings,
                self.dim
            ));
        }
        for (i, src) in values.rows().into_iter().enumerate() {
            write_row(&self.rows, i * self.dim, src, SharedRows::write_from);
        }
        Ok(())
    }

    pub(crate) fn load_flat(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(anyhow!(
                "Got {} values for table of shape ({}, {})",
                values.len(),
                self.num_embeddings,
                self.dim
            ));
        }
        self.rows.write_from(0, values);
        Ok(())
    }

    pub fn accumulator_value(&self, i: usize) -> f32 {
        self.accumulator.get(i)
    }

    pub fn accumulator(&self) -> Vec<f32> {
        self.accumulator.to_vec()
    }

    pub(crate) fn load_accumulator(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.num_embeddings {
            return Err(anyhow!(
                "Got {} accumulator values for table with {} rows",
                values.len(),
                self.num_embeddings
            ));
        }
        if let Some(bad) = values.iter().find(|v| !(**v >= 0.0)) {
            return Err(anyhow!("Accumulator values must be non-negative, got {}", bad));
        }
        self.accumulator.write_from(0, values);
        Ok(())
    }

    /// `accumulator[indices[k]] += grad_sq[k]`, same uniqueness rule as `scatter_add`.
    pub(crate) fn accumulate(&self, indices: &[usize], grad_sq: ArrayView1<f32>) {
        for (&i, &g) in indices.iter().zip(grad_sq.iter()) {
            self.accumulator.add(i, g);
        }
    }
}

fn write_row(
    rows: &SharedRows,
    start: usize,
    src: ArrayView1<f32>,
    op: fn(&SharedRows, usize, &[f32]),
) {
    match src.as_slice() {
        Some(slice) => op(rows, start, slice),
        None => op(rows, start, &src.to_vec()),
    }
}
