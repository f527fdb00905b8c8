use crate::device::Device;
use anyhow::{anyhow, Result};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use parking_lot::Mutex;
use std::sync::Arc;

struct Leaf {
    values: Array2<f32>,
    device: Device,
    grad: Mutex<Option<Array2<f32>>>,
}

/// Differentiable copy of a batch of rows. The training loop deposits the
/// gradient here; clones share the slot.
#[derive(Clone)]
pub struct TracedRows {
    leaf: Arc<Leaf>,
}

impl TracedRows {
    pub(crate) fn new(values: Array2<f32>, device: Device) -> Self {
        Self {
            leaf: Arc::new(Leaf {
                values,
                device,
                grad: Mutex::new(None),
            }),
        }
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.leaf.values
    }

    pub fn device(&self) -> Device {
        self.leaf.device
    }

    pub fn nrows(&self) -> usize {
        self.leaf.values.nrows()
    }

    fn check_shape(&self, grad: &ArrayView2<f32>) -> Result<()> {
        if grad.dim() != self.leaf.values.dim() {
            return Err(anyhow!(
                "Gradient of shape {:?} does not match traced rows of shape {:?}",
                grad.dim(),
                self.leaf.values.dim()
            ));
        }
        Ok(())
    }

    pub fn set_grad(&self, grad: Array2<f32>) -> Result<()> {
        self.check_shape(&grad.view())?;
        *self.leaf.grad.lock() = Some(grad);
        Ok(())
    }

    pub fn accumulate_grad(&self, grad: ArrayView2<f32>) -> Result<()> {
        self.check_shape(&grad)?;
        let mut slot = self.leaf.grad.lock();
        match slot.as_mut() {
            Some(existing) => *existing += &grad,
            None => *slot = Some(grad.to_owned()),
        }
        Ok(())
    }

    pub fn grad(&self) -> Option<Array2<f32>> {
        self.leaf.grad.lock().clone()
    }

    pub fn has_grad(&self) -> bool {
        self.leaf.grad.lock().is_some()
    }

    pub(crate) fn take_grad(&self) -> Option<Array2<f32>> {
        self.leaf.grad.lock().take()
    }
}

pub enum EmbeddingRows {
    Traced(TracedRows),
    Detached { values: Array2<f32>, device: Device },
}

impl EmbeddingRows {
    pub fn values(&self) -> &Array2<f32> {
        match self {
            EmbeddingRows::Traced(rows) => rows.values(),
            EmbeddingRows::Detached { values, .. } => values,
        }
    }

    pub fn device(&self) -> Device {
        match self {
            EmbeddingRows::Traced(rows) => rows.device(),
            EmbeddingRows::Detached { device, .. } => *device,
        }
    }

    pub fn traced(&self) -> Option<&TracedRows> {
        match self {
            EmbeddingRows::Traced(rows) => Some(rows),
            EmbeddingRows::Detached { .. } => None,
        }
    }

    pub fn is_traced(&self) -> bool {
        self.traced().is_some()
    }

    pub fn into_values(self) -> Array2<f32> {
        match self {
            EmbeddingRows::Traced(rows) => rows.values().clone(),
            EmbeddingRows::Detached { values, .. } => values,
        }
    }
}

pub struct TraceEntry {
    pub indices: Vec<usize>,
    pub rows: TracedRows,
}

#[derive(Default)]
pub struct AccessTrace {
    entries: Vec<TraceEntry>,
}

impl AccessTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, indices: Vec<usize>, rows: TracedRows) {
        self.entries.push(TraceEntry { indices, rows });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    pub fn drain(&mut self) -> Vec<TraceEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// All traced values stacked in trace order.
    pub fn concat_values(&self, dim: usize) -> Result<Array2<f32>> {
        if self.entries.is_empty() {
            return Ok(Array2::zeros((0, dim)));
        }
        let views: Vec<ArrayView2<f32>> = self.entries.iter().map(|e| e.rows.values().view()).collect();
        concatenate(Axis(0), &views).map_err(|e| anyhow!("Failed to stack traced rows: {}", e))
    }
}
