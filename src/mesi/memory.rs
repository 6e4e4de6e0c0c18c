use std::sync::atomic::{AtomicU64, Ordering};

use super::common::{Addr, Value};
use crate::error::{Result, SimError};

/// Main memory shared by all cores. Every word is an independent atomic so
/// accesses to different addresses never interfere; same-address writes only
/// come from write-backs, which the bus serializes.
#[derive(Debug)]
pub struct MemoryStore {
    words: Vec<AtomicU64>,
}

impl MemoryStore {
    pub fn new(size: usize) -> Self {
        MemoryStore {
            words: (0..size).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn check(&self, addr: Addr) -> Result<()> {
        if addr.0 < self.words.len() {
            Ok(())
        } else {
            Err(SimError::AddressOutOfRange {
                address: addr.0,
                memory_size: self.words.len(),
            })
        }
    }

    pub fn read(&self, addr: Addr) -> Result<Value> {
        self.check(addr)?;
        Ok(self.words[addr.0].load(Ordering::Acquire))
    }

    pub fn write(&self, addr: Addr, value: Value) -> Result<()> {
        self.check(addr)?;
        self.words[addr.0].store(value, Ordering::Release);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.words.iter().map(|w| w.load(Ordering::Acquire)).collect()
    }
}
