use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a table lives, or where a gathered batch is staged.
///
/// Follows the integer convention of the training configs: `-1` is the host,
/// any other id is an accelerator ordinal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Gpu(usize),
}

impl Device {
    pub fn from_gpu_id(gpu: i32) -> Self {
        if gpu < 0 {
            Device::Cpu
        } else {
            Device::Gpu(gpu as usize)
        }
    }

    pub fn gpu_id(&self) -> i32 {
        match self {
            Device::Cpu => -1,
            Device::Gpu(ordinal) => *ordinal as i32,
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(ordinal) => write!(f, "cuda:{}", ordinal),
        }
    }
}
