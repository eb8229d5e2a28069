pub mod batch;
pub mod engine;
pub mod log_engine;
pub mod memory;

pub use batch::{WriteBatch, WriteOp};
pub use engine::{Engine, EngineSnapshot};
pub use log_engine::LogEngine;
pub use memory::MemoryEngine;
