//! `<name>.bin` holds rows as little-endian f32, `<name>.json` their shape.

use crate::{device::Device, table::EmbeddingTable};
use anyhow::{anyhow, Result};
use kge_structs::core::{StateMeta, TableMeta, DTYPE_F32};
use kge_utils::{read_f32_file_exact, read_json_file, write_f32_file, write_json_file};
use std::path::{Path, PathBuf};
use tracing::info;

pub fn rows_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.bin", name))
}

pub fn meta_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

pub fn state_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}_state.bin", name))
}

pub fn state_meta_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}_state.json", name))
}

pub fn read_meta(dir: &Path, name: &str) -> Result<TableMeta> {
    let meta: TableMeta = read_json_file(&meta_path(dir, name))?;
    if meta.dtype != DTYPE_F32 {
        return Err(anyhow!(
            "Table '{}' has dtype '{}', only '{}' is supported",
            name,
            meta.dtype,
            DTYPE_F32
        ));
    }
    Ok(meta)
}

pub fn read_rows(dir: &Path, name: &str) -> Result<(TableMeta, Vec<f32>)> {
    let meta = read_meta(dir, name)?;
    let values = read_f32_file_exact(&rows_path(dir, name), meta.num_values())?;
    Ok((meta, values))
}

pub fn has_state(dir: &Path, name: &str) -> bool {
    state_path(dir, name).exists() && state_meta_path(dir, name).exists()
}

impl EmbeddingTable {
    pub fn save(&self, dir: &Path, name: &str) -> Result<()> {
        let meta = TableMeta::new(name, self.num_embeddings(), self.dim());
        write_f32_file(&rows_path(dir, name), self.row_values())?;
        write_json_file(&meta_path(dir, name), &meta)?;
        info!(name, num_embeddings = meta.num_embeddings, dim = meta.dim, "saved table");
        Ok(())
    }

    /// Loads rows saved under `name`; the saved shape must match this table.
    pub fn load(&self, dir: &Path, name: &str) -> Result<()> {
        let meta = read_meta(dir, name)?;
        if meta.num_embeddings != self.num_embeddings() || meta.dim != self.dim() {
            return Err(anyhow!(
                "Saved table '{}' has shape ({}, {}), expected ({}, {})",
                name,
                meta.num_embeddings,
                meta.dim,
                self.num_embeddings(),
                self.dim()
            ));
        }
        let values = read_f32_file_exact(&rows_path(dir, name), meta.num_values())?;
        self.load_flat(&values)?;
        info!(name, "loaded table");
        Ok(())
    }

    /// Builds a table from the files saved under `name`.
    pub fn open(dir: &Path, name: &str, device: Device) -> Result<Self> {
        let (meta, values) = read_rows(dir, name)?;
        let table = Self::new(meta.num_embeddings, meta.dim, device)?;
        table.load_flat(&values)?;
        info!(name, num_embeddings = meta.num_embeddings, dim = meta.dim, "opened table");
        Ok(table)
    }

    pub fn save_state(&self, dir: &Path, name: &str) -> Result<()> {
        let meta = StateMeta {
            name: name.to_string(),
            num_embeddings: self.num_embeddings(),
            step: self.step(),
        };
        write_f32_file(&state_path(dir, name), self.accumulator())?;
        write_json_file(&state_meta_path(dir, name), &meta)?;
        Ok(())
    }

    pub fn load_state(&self, dir: &Path, name: &str) -> Result<()> {
        let meta: StateMeta = read_json_file(&state_meta_path(dir, name))?;
        if meta.num_embeddings != self.num_embeddings() {
            return Err(anyhow!(
                "Saved state '{}' covers {} rows, table has {}",
                name,
                meta.num_embeddings,
                self.num_embeddings()
            ));
        }
        let values = read_f32_file_exact(&state_path(dir, name), meta.num_embeddings)?;
        self.load_accumulator(&values)?;
        self.set_step(meta.step);
        Ok(())
    }
}
