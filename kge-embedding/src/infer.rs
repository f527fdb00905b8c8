use crate::{device::Device, persist::read_rows};
use anyhow::{anyhow, Result};
use ndarray::{Array2, Axis};
use std::path::Path;

/// Read-only embedding for evaluation. No trace, no optimizer state.
pub struct InferEmbedding {
    rows: Array2<f32>,
    device: Device,
}

impl InferEmbedding {
    pub fn load(dir: &Path, name: &str, device: Device) -> Result<Self> {
        let (meta, values) = read_rows(dir, name)?;
        let rows = Array2::from_shape_vec((meta.num_embeddings, meta.dim), values)
            .map_err(|e| anyhow!("Table '{}' does not match its metadata: {}", name, e))?;
        Ok(Self { rows, device })
    }

    pub fn from_array(rows: Array2<f32>, device: Device) -> Self {
        Self { rows, device }
    }

    pub fn num_embeddings(&self) -> usize {
        self.rows.nrows()
    }

    pub fn dim(&self) -> usize {
        self.rows.ncols()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn lookup(&self, indices: &[usize]) -> Result<Array2<f32>> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.rows.nrows()) {
            return Err(anyhow!(
                "Row index {} out of range for table with {} rows",
                bad,
                self.rows.nrows()
            ));
        }
        Ok(self.rows.select(Axis(0), indices))
    }
}
