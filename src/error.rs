use std::path::PathBuf;

use thiserror::Error;

/// Everything that can stop a core's stream or a whole simulation run.
#[derive(Error, Debug)]
pub enum SimError {
    /// An instruction referenced an address outside of main memory.
    #[error("address {address} is out of range (memory size {memory_size})")]
    AddressOutOfRange { address: usize, memory_size: usize },

    /// An instruction line could not be decoded.
    #[error("malformed instruction on line {line} ({reason}): {text:?}")]
    MalformedInstruction {
        line: usize,
        text: String,
        reason: &'static str,
    },

    /// The bus observed cache states that MESI forbids. Fatal for the run.
    #[error("protocol invariant violated at address {address}: {detail}")]
    ProtocolInvariantViolation { address: usize, detail: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The bus worker has shut down and no longer resolves transactions.
    #[error("coherence bus is closed")]
    BusClosed,

    /// A thread panicked while holding a cache lock.
    #[error("cache lock poisoned")]
    LockPoisoned,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker thread {0} panicked")]
    WorkerPanicked(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SimError>;
