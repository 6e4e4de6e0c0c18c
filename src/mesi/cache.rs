use std::fmt;
use std::ops::Range;

use log::debug;

use super::common::*;
use super::memory::MemoryStore;
use crate::error::{Result, SimError};

// cache lines

/// One slot of a private cache. `addr == None` marks a slot that was never
/// filled, which is different from a tagged line in the Invalid state.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheLine {
    pub addr: Option<Addr>,
    pub value: Value,
    pub state: MesiState,
}

impl CacheLine {
    pub fn holds(&self, addr: Addr) -> bool {
        self.addr == Some(addr)
    }

    pub fn is_valid_for(&self, addr: Addr) -> bool {
        self.holds(addr) && self.state.is_valid()
    }
}

impl fmt::Display for CacheLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "Address: {}, State: {}, Data: {}", addr, self.state, self.value),
            None => write!(f, "Address: -, State: {}, Data: {}", self.state, self.value),
        }
    }
}

// replacement

/// Chooses which slot of a set gets replaced when a new address moves in.
pub trait ReplacementPolicy: Send + fmt::Debug {
    /// record a use of `slot`
    fn touch(&mut self, slot: usize);
    /// pick a victim within `set`; `set` is never empty
    fn victim(&self, set: Range<usize>, lines: &[CacheLine]) -> usize;
}

/// Least-recently-used. Empty slots go first, then Invalid ones, then the
/// oldest line; equal ages fall back to the lowest way.
#[derive(Debug)]
pub struct Lru {
    last_used: Vec<u64>,
    mru_ctr: u64,
}

impl Lru {
    pub fn new(slots: usize) -> Self {
        Lru { last_used: vec![0; slots], mru_ctr: 0 }
    }
}

impl ReplacementPolicy for Lru {
    fn touch(&mut self, slot: usize) {
        self.mru_ctr += 1;
        self.last_used[slot] = self.mru_ctr;
    }

    fn victim(&self, set: Range<usize>, lines: &[CacheLine]) -> usize {
        if let Some(i) = set.clone().find(|&i| lines[i].addr.is_none()) {
            return i;
        }
        if let Some(i) = set.clone().find(|&i| !lines[i].state.is_valid()) {
            return i;
        }
        let first = set.start;
        set.min_by_key(|&i| self.last_used[i]).unwrap_or(first)
    }
}

// cache

pub struct PrivateCache {
    lines: Vec<CacheLine>,
    ways: usize,
    num_sets: usize,
    policy: Box<dyn ReplacementPolicy>,
}

impl fmt::Debug for PrivateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateCache")
            .field("ways", &self.ways)
            .field("num_sets", &self.num_sets)
            .field("lines", &self.lines)
            .finish()
    }
}

impl PrivateCache {
    /// `num_lines` must be a positive multiple of `ways`.
    pub fn new(num_lines: usize, ways: usize) -> Result<Self> {
        Self::with_policy(num_lines, ways, Box::new(Lru::new(num_lines)))
    }

    pub fn direct_mapped(num_lines: usize) -> Result<Self> {
        Self::new(num_lines, 1)
    }

    pub fn with_policy(num_lines: usize, ways: usize, policy: Box<dyn ReplacementPolicy>) -> Result<Self> {
        if num_lines == 0 || ways == 0 || num_lines % ways != 0 {
            return Err(SimError::InvalidConfig(format!(
                "a cache of {num_lines} lines cannot be split into sets of {ways} ways"
            )));
        }
        Ok(PrivateCache {
            lines: vec![CacheLine::default(); num_lines],
            ways,
            num_sets: num_lines / ways,
            policy,
        })
    }

    // helper functions

    fn set_of(&self, addr: Addr) -> Range<usize> {
        let index = addr.0 % self.num_sets;
        index * self.ways..(index + 1) * self.ways
    }

    fn slot_of(&self, addr: Addr) -> Option<usize> {
        self.set_of(addr).find(|&i| self.lines[i].holds(addr))
    }

    fn valid_slot_of(&self, addr: Addr) -> Option<usize> {
        self.slot_of(addr).filter(|&i| self.lines[i].state.is_valid())
    }

    // queries

    /// The line for `addr` if it is tagged with `addr` and not Invalid.
    pub fn lookup(&self, addr: Addr) -> Option<&CacheLine> {
        self.valid_slot_of(addr).map(|i| &self.lines[i])
    }

    pub fn state_of(&self, addr: Addr) -> MesiState {
        self.lookup(addr).map_or(MesiState::Invalid, |l| l.state)
    }

    pub fn lines(&self) -> &[CacheLine] {
        &self.lines
    }

    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    // processor side

    /// Local read hit. Returns `None` on a miss; never changes MESI state.
    pub fn read(&mut self, addr: Addr) -> Option<Value> {
        let slot = self.valid_slot_of(addr)?;
        self.policy.touch(slot);
        Some(self.lines[slot].value)
    }

    /// Local write hit on a Modified line. Anything else needs the bus.
    pub fn write_modified(&mut self, addr: Addr, value: Value) -> bool {
        match self.valid_slot_of(addr) {
            Some(slot) if self.lines[slot].state == MesiState::Modified => {
                self.lines[slot].value = value;
                self.policy.touch(slot);
                true
            }
            _ => false,
        }
    }

    /// Places `addr` in its set. A displaced Modified line is written back to
    /// `memory` before the new line lands; this is the only eviction path.
    pub fn install(
        &mut self,
        addr: Addr,
        value: Value,
        state: MesiState,
        memory: &MemoryStore,
    ) -> Result<Option<Eviction>> {
        let slot = match self.slot_of(addr) {
            Some(slot) => slot,
            None => self.policy.victim(self.set_of(addr), &self.lines),
        };
        let old = self.lines[slot];
        let mut eviction = None;
        if let Some(old_addr) = old.addr.filter(|a| *a != addr) {
            if old.state.is_valid() {
                let written_back = old.state == MesiState::Modified;
                if written_back {
                    memory.write(old_addr, old.value)?;
                }
                debug!(
                    "evicting {} ({}, {}) for {}{}",
                    old_addr,
                    old.state,
                    old.value,
                    addr,
                    if written_back { ", written back" } else { "" }
                );
                eviction = Some(Eviction { addr: old_addr, value: old.value, written_back });
            }
        }
        self.lines[slot] = CacheLine { addr: Some(addr), value, state };
        self.policy.touch(slot);
        Ok(eviction)
    }

    // bus side (snoop only)

    /// Moves a valid line to `new_state`, returning the line as it was before.
    pub(crate) fn downgrade(&mut self, addr: Addr, new_state: MesiState) -> Option<CacheLine> {
        let slot = self.valid_slot_of(addr)?;
        let before = self.lines[slot];
        self.lines[slot].state = new_state;
        Some(before)
    }

    pub(crate) fn invalidate(&mut self, addr: Addr) -> Option<CacheLine> {
        self.downgrade(addr, MesiState::Invalid)
    }
}
