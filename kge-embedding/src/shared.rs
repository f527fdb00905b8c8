//! Fixed-size f32 buffers in shared anonymous memory.
//!
//! Every cell is an `AtomicU32` holding the bit pattern of an `f32`, so any
//! thread holding a reference sees the same memory without copies. Loads and
//! stores are relaxed and `add` is a plain load followed by a store: two
//! writers touching the same cell can lose an update. Callers keep a single
//! writer per table.

use anyhow::{anyhow, Result};
use memmap2::{MmapMut, MmapOptions};
use std::{
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicU32, Ordering},
};

pub struct SharedRows {
    // Owns the mapping; `cells` points into it.
    _map: MmapMut,
    cells: NonNull<AtomicU32>,
    len: usize,
}

// SAFETY: the mapping is owned for the lifetime of `SharedRows` and every
// access goes through `AtomicU32`.
unsafe impl Send for SharedRows {}
unsafe impl Sync for SharedRows {}

impl SharedRows {
    /// Maps `len` zeroed cells. The size is fixed for the buffer's lifetime.
    pub fn zeroed(len: usize) -> Result<Self> {
        // Zero-length mappings are rejected by the OS.
        let byte_len = len.max(1) * std::mem::size_of::<AtomicU32>();
        let mut map = MmapOptions::new()
            .len(byte_len)
            .map_anon()
            .map_err(|e| anyhow!("Failed to map {} bytes of shared memory: {}", byte_len, e))?;
        let cells = NonNull::new(map.as_mut_ptr() as *mut AtomicU32)
            .ok_or_else(|| anyhow!("Shared memory mapping returned a null pointer"))?;
        Ok(Self {
            _map: map,
            cells,
            len,
        })
    }

    fn cells(&self) -> &[AtomicU32] {
        // SAFETY: the mapping is page aligned, at least `len` cells long and
        // zero-initialised, which is a valid `AtomicU32` bit pattern.
        unsafe { slice::from_raw_parts(self.cells.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, i: usize) -> f32 {
        f32::from_bits(self.cells()[i].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, i: usize, value: f32) {
        self.cells()[i].store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, i: usize, delta: f32) {
        let cell = &self.cells()[i];
        let current = f32::from_bits(cell.load(Ordering::Relaxed));
        cell.store((current + delta).to_bits(), Ordering::Relaxed);
    }

    pub fn read_into(&self, start: usize, out: &mut [f32]) {
        let cells = &self.cells()[start..start + out.len()];
        for (o, c) in out.iter_mut().zip(cells) {
            *o = f32::from_bits(c.load(Ordering::Relaxed));
        }
    }

    pub fn write_from(&self, start: usize, values: &[f32]) {
        let cells = &self.cells()[start..start + values.len()];
        for (c, v) in cells.iter().zip(values) {
            c.store(v.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn add_from(&self, start: usize, deltas: &[f32]) {
        let cells = &self.cells()[start..start + deltas.len()];
        for (c, d) in cells.iter().zip(deltas) {
            let current = f32::from_bits(c.load(Ordering::Relaxed));
            c.store((current + d).to_bits(), Ordering::Relaxed);
        }
    }

    pub fn fill(&self, value: f32) {
        let bits = value.to_bits();
        for c in self.cells() {
            c.store(bits, Ordering::Relaxed);
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.cells()
            .iter()
            .map(|c| f32::from_bits(c.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        self.cells()
            .iter()
            .map(|c| f32::from_bits(c.load(Ordering::Relaxed)))
    }
}
