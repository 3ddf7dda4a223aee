pub mod chunk;
pub mod ranking;

pub use chunk::{Chunk, Metadata};
pub use ranking::{FusedResult, FusionStrategy, RankedEntry};
