mod processor;
mod cache;
mod bus;
mod common;
mod memory;

pub use processor::{CoreReport, CoreStats, Processor};
pub use cache::{CacheLine, Lru, PrivateCache, ReplacementPolicy};
pub use bus::{check_address, BusHandle, BusStats, CoherenceBus, SharedCache};
pub use common::*;
pub use memory::MemoryStore;
