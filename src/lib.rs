//! A multi-core MESI cache coherence simulator.
//!
//! Every core owns a private cache and runs on its own thread; the cores stay
//! coherent through a single bus worker that serializes read misses, write
//! misses and upgrades, and writes dirty lines back to shared memory.

pub mod error;
pub mod mesi;
pub mod simulator;
pub mod utils;

pub use error::{Result, SimError};
pub use simulator::{SimReport, Simulation};
