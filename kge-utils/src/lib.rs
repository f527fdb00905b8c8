mod f32_file;
pub use f32_file::*;
mod hash;
pub use hash::*;
mod json;
pub use json::*;
