use crate::serializable_struct_with_getters;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use kge_utils::seed_from_name;

fn default_num_thread() -> usize {
    1
}

fn default_gpu() -> Vec<i32> {
    vec![-1]
}

fn default_emb_init() -> f32 {
    0.1
}

serializable_struct_with_getters! {
    EmbeddingConfig {
        lr: f32,
        #[serde(default = "default_num_thread")]
        num_thread: usize,
        #[serde(default = "default_gpu")]
        gpu: Vec<i32>,
        #[serde(default)]
        async_update: bool,
        #[serde(default = "default_emb_init")]
        emb_init: f32,
        seed: Option<u64>,
    }
}

impl EmbeddingConfig {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            num_thread: default_num_thread(),
            gpu: default_gpu(),
            async_update: false,
            emb_init: default_emb_init(),
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(anyhow!("lr must be a positive finite number, got {}", self.lr));
        }
        if self.num_thread == 0 {
            return Err(anyhow!("num_thread must be at least 1"));
        }
        if !self.emb_init.is_finite() || self.emb_init < 0.0 {
            return Err(anyhow!(
                "emb_init must be a non-negative finite number, got {}",
                self.emb_init
            ));
        }
        if self.gpu.iter().any(|&g| g < -1) {
            return Err(anyhow!("gpu ids must be -1 (host) or a device ordinal, got {:?}", self.gpu));
        }
        Ok(())
    }

    /// First configured device id; -1 is the host.
    pub fn primary_gpu(&self) -> i32 {
        self.gpu.first().copied().unwrap_or(-1)
    }

    pub fn seed_for(&self, table_name: &str) -> u64 {
        self.seed.unwrap_or_else(|| seed_from_name(table_name))
    }
}
