use crate::table::EmbeddingTable;
use anyhow::{anyhow, Result};
use std::sync::Arc;

/// Overflow rows live in `authoritative`; the partitioned table only mirrors
/// them. Reads refresh the mirror, updates write both.
pub struct CrossRelPartition {
    membership: Vec<bool>,
    num_overflow: usize,
    authoritative: Arc<EmbeddingTable>,
}

impl CrossRelPartition {
    /// `authoritative` must be a different table with the same shape as `mirror`.
    pub fn new(
        mirror: &EmbeddingTable,
        overflow_row_ids: &[usize],
        authoritative: Arc<EmbeddingTable>,
    ) -> Result<Self> {
        if std::ptr::eq(mirror, authoritative.as_ref()) {
            return Err(anyhow!(
                "Authoritative overflow table must be a separate table from the one it partitions"
            ));
        }
        if authoritative.num_embeddings() != mirror.num_embeddings()
            || authoritative.dim() != mirror.dim()
        {
            return Err(anyhow!(
                "Authoritative table of shape ({}, {}) does not match partitioned table of shape ({}, {})",
                authoritative.num_embeddings(),
                authoritative.dim(),
                mirror.num_embeddings(),
                mirror.dim()
            ));
        }
        mirror.check_indices(overflow_row_ids)?;
        let mut membership = vec![false; mirror.num_embeddings()];
        for &id in overflow_row_ids {
            membership[id] = true;
        }
        let num_overflow = membership.iter().filter(|m| **m).count();
        Ok(Self {
            membership,
            num_overflow,
            authoritative,
        })
    }

    pub fn is_overflow(&self, row: usize) -> bool {
        self.membership.get(row).copied().unwrap_or(false)
    }

    pub fn num_overflow(&self) -> usize {
        self.num_overflow
    }

    pub fn authoritative(&self) -> &EmbeddingTable {
        &self.authoritative
    }

    /// Positions within `indices` that address overflow rows.
    pub fn overflow_positions(&self, indices: &[usize]) -> Vec<usize> {
        indices
            .iter()
            .enumerate()
            .filter(|(_, i)| self.is_overflow(**i))
            .map(|(p, _)| p)
            .collect()
    }

    /// Distinct overflow rows addressed by `indices`, ascending.
    pub fn overflow_rows(&self, indices: &[usize]) -> Vec<usize> {
        let mut rows: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| self.is_overflow(i))
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }

    /// Copies the authoritative values of the overflow rows in `indices` into
    /// `mirror`. Returns the number of rows copied.
    pub fn refresh_mirror(&self, mirror: &EmbeddingTable, indices: &[usize]) -> Result<usize> {
        let rows = self.overflow_rows(indices);
        if rows.is_empty() {
            return Ok(0);
        }
        let fresh = self.authoritative.gather(&rows)?;
        mirror.write_rows(&rows, fresh.view())?;
        Ok(rows.len())
    }
}
