//! Row-sparse embedding storage and Adagrad updates for knowledge graph training.

pub mod adagrad;
pub use adagrad::*;
pub mod async_update;
pub use async_update::*;
pub mod cross_rel;
pub use cross_rel::*;
mod device;
pub use device::*;
mod embedding;
pub use embedding::*;
mod infer;
pub use infer::*;
pub mod persist;
mod shared;
pub use shared::*;
mod table;
pub use table::*;
pub mod trace;
pub use trace::*;
