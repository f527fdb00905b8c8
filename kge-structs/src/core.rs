use crate::serializable_struct_with_getters;
use serde::{Deserialize, Serialize};

pub const DTYPE_F32: &str = "f32";

serializable_struct_with_getters! {
    TableMeta {
        name: String,
        num_embeddings: usize,
        dim: usize,
        dtype: String,
    }
}

impl TableMeta {
    pub fn new(name: &str, num_embeddings: usize, dim: usize) -> Self {
        Self {
            name: name.to_string(),
            num_embeddings,
            dim,
            dtype: DTYPE_F32.to_string(),
        }
    }

    pub fn num_values(&self) -> usize {
        self.num_embeddings * self.dim
    }
}

serializable_struct_with_getters! {
    StateMeta {
        name: String,
        num_embeddings: usize,
        step: u64,
    }
}

serializable_struct_with_getters! {
    TableStats {
        name: String,
        num_embeddings: usize,
        dim: usize,
        step: Option<u64>,
        min_row_norm: f32,
        mean_row_norm: f32,
        max_row_norm: f32,
        accumulator_sum: Option<f64>,
    }
}
