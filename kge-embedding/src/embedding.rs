use crate::{
    adagrad::SparseAdagrad,
    async_update::{AsyncUpdater, UpdateContext},
    cross_rel::CrossRelPartition,
    device::Device,
    table::EmbeddingTable,
    trace::{AccessTrace, EmbeddingRows, TracedRows},
};
use anyhow::{anyhow, Result};
use kge_structs::config::EmbeddingConfig;
use ndarray::Array2;
use std::{path::Path, sync::Arc};
use tracing::{debug, warn};

enum UpdatePath {
    Sync,
    Async(AsyncUpdater),
    /// The async worker has been shut down; the table is read-only from here.
    Closed,
}

/// A handle over a shared [`EmbeddingTable`] with its own access trace. Each
/// handle uses exactly one update path, sync or async.
pub struct ExternalEmbedding {
    table: Arc<EmbeddingTable>,
    optimizer: SparseAdagrad,
    trace: AccessTrace,
    cross_rel: Option<Arc<CrossRelPartition>>,
    path: UpdatePath,
}

impl ExternalEmbedding {
    pub fn new(config: &EmbeddingConfig, num_embeddings: usize, dim: usize) -> Result<Self> {
        config.validate()?;
        let device = Device::from_gpu_id(config.primary_gpu());
        let table = EmbeddingTable::new(num_embeddings, dim, device)?;
        Self::from_table(Arc::new(table), config.lr)
    }

    pub fn from_table(table: Arc<EmbeddingTable>, lr: f32) -> Result<Self> {
        Ok(Self {
            table,
            optimizer: SparseAdagrad::new(lr)?,
            trace: AccessTrace::new(),
            cross_rel: None,
            path: UpdatePath::Sync,
        })
    }

    /// Same table, update path and partition; fresh trace.
    pub fn share(&self) -> Result<Self> {
        let path = match &self.path {
            UpdatePath::Sync => UpdatePath::Sync,
            UpdatePath::Async(updater) => UpdatePath::Async(updater.producer()),
            UpdatePath::Closed => {
                return Err(anyhow!("Cannot share a table whose async worker has shut down"))
            }
        };
        Ok(Self {
            table: self.table.clone(),
            optimizer: self.optimizer,
            trace: AccessTrace::new(),
            cross_rel: self.cross_rel.clone(),
            path,
        })
    }

    pub fn table(&self) -> &Arc<EmbeddingTable> {
        &self.table
    }

    pub fn num_embeddings(&self) -> usize {
        self.table.num_embeddings()
    }

    pub fn dim(&self) -> usize {
        self.table.dim()
    }

    pub fn lr(&self) -> f32 {
        self.optimizer.lr()
    }

    pub fn trace(&self) -> &AccessTrace {
        &self.trace
    }

    pub fn has_cross_rel(&self) -> bool {
        self.cross_rel.is_some()
    }

    pub fn is_async(&self) -> bool {
        matches!(self.path, UpdatePath::Async(_))
    }

    pub fn init(&self, emb_init: f32, seed: u64) -> Result<()> {
        self.table.init(emb_init, seed)
    }

    /// Marks `overflow_row_ids` as host-resident with `authoritative` holding
    /// their real values. Must happen before the async worker starts.
    pub fn setup_cross_rels(
        &mut self,
        overflow_row_ids: &[usize],
        authoritative: Arc<EmbeddingTable>,
    ) -> Result<()> {
        if !matches!(self.path, UpdatePath::Sync) {
            return Err(anyhow!(
                "Cross relations must be set up before the async update worker starts"
            ));
        }
        let partition = CrossRelPartition::new(&self.table, overflow_row_ids, authoritative)?;
        debug!(overflow_rows = partition.num_overflow(), "cross relations set up");
        self.cross_rel = Some(Arc::new(partition));
        Ok(())
    }

    /// With `trace = true` the rows are a differentiable copy recorded in the trace.
    pub fn read(
        &mut self,
        indices: &[usize],
        target: Option<Device>,
        trace: bool,
    ) -> Result<EmbeddingRows> {
        if let Some(partition) = &self.cross_rel {
            let refreshed = partition.refresh_mirror(&self.table, indices)?;
            if refreshed > 0 {
                debug!(refreshed, "refreshed overflow mirror rows");
            }
        }
        let values = self.table.gather(indices)?;
        let device = target.unwrap_or_else(|| self.table.device());
        if trace {
            let rows = TracedRows::new(values, device);
            self.trace.record(indices.to_vec(), rows.clone());
            Ok(EmbeddingRows::Traced(rows))
        } else {
            Ok(EmbeddingRows::Detached { values, device })
        }
    }

    /// Applies the gradients collected on every traced read since the last
    /// update, then bumps the step counter. `device` is where per-row
    /// arithmetic is staged for async jobs.
    ///
    /// The trace is drained up front: if applying or enqueueing one entry
    /// fails, the entries after it are dropped and the step is not counted.
    pub fn update(&mut self, device: Option<Device>) -> Result<()> {
        if matches!(self.path, UpdatePath::Closed) {
            return Err(anyhow!("async update pipeline has been shut down"));
        }
        let device = device.unwrap_or_else(|| self.table.device());
        let context = UpdateContext {
            table: self.table.clone(),
            partition: self.cross_rel.clone(),
            optimizer: self.optimizer,
        };
        for entry in self.trace.drain() {
            let Some(grad) = entry.rows.take_grad() else {
                warn!(
                    rows = entry.indices.len(),
                    "traced rows received no gradient; skipping"
                );
                continue;
            };
            match &mut self.path {
                UpdatePath::Sync => context.apply(&entry.indices, &grad)?,
                UpdatePath::Async(updater) => updater.submit(entry.indices, grad, device)?,
                UpdatePath::Closed => {
                    return Err(anyhow!("async update pipeline has been shut down"))
                }
            }
        }
        self.table.increment_step();
        Ok(())
    }

    pub fn create_async_update(&mut self, num_thread: usize) -> Result<()> {
        match self.path {
            UpdatePath::Sync => {}
            UpdatePath::Async(_) => return Err(anyhow!("Async update worker already running")),
            UpdatePath::Closed => {
                return Err(anyhow!("Async update worker has already been shut down"))
            }
        }
        let context = UpdateContext {
            table: self.table.clone(),
            partition: self.cross_rel.clone(),
            optimizer: self.optimizer,
        };
        self.path = UpdatePath::Async(AsyncUpdater::spawn(context, num_thread)?);
        Ok(())
    }

    /// Flushes every queued update and stops the worker. Returns the number of
    /// jobs the worker applied, or the failure it stopped with.
    pub fn finish_async_update(&mut self) -> Result<u64> {
        let UpdatePath::Async(updater) = &mut self.path else {
            return Err(anyhow!("No async update worker running"));
        };
        if !updater.owns_worker() {
            return Err(anyhow!(
                "Only the handle that created the async update worker can finish it"
            ));
        }
        let result = updater.finish();
        self.path = UpdatePath::Closed;
        result
    }

    pub fn curr_emb(&self) -> Result<Array2<f32>> {
        self.trace.concat_values(self.table.dim())
    }

    pub fn save(&self, dir: &Path, name: &str) -> Result<()> {
        self.table.save(dir, name)
    }

    pub fn load(&self, dir: &Path, name: &str) -> Result<()> {
        self.table.load(dir, name)
    }
}
