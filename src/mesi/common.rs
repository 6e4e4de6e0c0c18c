use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SimError};

// machine configuration

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimConfig {         // unit         defaults
    pub num_cores: usize,      // cores        2
    pub cache_lines: usize,    // lines/core   2
    pub ways: usize,           // lines/set    1 (direct-mapped)
    pub memory_size: usize,    // words        24
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            num_cores: 2,
            cache_lines: 2,
            ways: 1,
            memory_size: 24,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(SimError::InvalidConfig(msg));
        if self.num_cores == 0 {
            return fail("num_cores must be positive".into());
        }
        if self.cache_lines == 0 {
            return fail("cache_lines must be positive".into());
        }
        if self.memory_size == 0 {
            return fail("memory_size must be positive".into());
        }
        if self.ways == 0 || self.cache_lines % self.ways != 0 {
            return fail(format!(
                "ways ({}) must be positive and divide cache_lines ({})",
                self.ways, self.cache_lines
            ));
        }
        Ok(())
    }

    pub fn num_sets(&self) -> usize {
        self.cache_lines / self.ways
    }
}

// addresses and values

pub type Value = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub usize);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub usize);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MesiState {
    Modified,
    Exclusive,
    Shared,
    #[default]
    Invalid,
}

impl MesiState {
    pub fn is_valid(self) -> bool {
        self != MesiState::Invalid
    }

    /// Modified or Exclusive: no other core may hold a valid copy.
    pub fn is_owner(self) -> bool {
        matches!(self, MesiState::Modified | MesiState::Exclusive)
    }
}

impl fmt::Display for MesiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MesiState::Modified => "Modified",
            MesiState::Exclusive => "Exclusive",
            MesiState::Shared => "Shared",
            MesiState::Invalid => "Invalid",
        };
        f.pad(s)
    }
}

// instructions

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instr {
    Read(Addr),
    Write(Addr, Value),
}

impl Instr {
    pub fn addr(&self) -> Addr {
        match self {
            Instr::Read(addr) | Instr::Write(addr, _) => *addr,
        }
    }

    pub fn kind(&self) -> AccessKind {
        match self {
            Instr::Read(_) => AccessKind::Read,
            Instr::Write(..) => AccessKind::Write,
        }
    }
}

pub type Insts = Vec<Instr>;

// bus transactions

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BusTxKind {
    ReadMiss,
    WriteMiss,
    Upgrade,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusTransaction {
    pub initiator: CoreId,
    pub kind: BusTxKind,
    pub addr: Addr,
    /// value installed by WriteMiss/Upgrade, ignored for ReadMiss
    pub write_value: Option<Value>,
}

impl BusTransaction {
    pub fn read_miss(initiator: CoreId, addr: Addr) -> Self {
        BusTransaction { initiator, kind: BusTxKind::ReadMiss, addr, write_value: None }
    }

    pub fn write_miss(initiator: CoreId, addr: Addr, value: Value) -> Self {
        BusTransaction { initiator, kind: BusTxKind::WriteMiss, addr, write_value: Some(value) }
    }

    pub fn upgrade(initiator: CoreId, addr: Addr, value: Value) -> Self {
        BusTransaction { initiator, kind: BusTxKind::Upgrade, addr, write_value: Some(value) }
    }
}

/// How the bus satisfied a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    HitFromPeer(CoreId),
    HitFromMemory,
    FreshExclusive,
}

/// A line pushed out of a cache to make room for a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eviction {
    pub addr: Addr,
    pub value: Value,
    pub written_back: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    /// position of the transaction in the bus's total order, starting at 1
    pub seq: u64,
    pub verdict: Verdict,
    pub supplied_value: Option<Value>,
    pub supplier: Option<CoreId>,
    /// final state of every core whose line for the address changed, initiator included
    pub new_states: BTreeMap<CoreId, MesiState>,
    /// value the initiator holds after the transaction
    pub value: Value,
    pub eviction: Option<Eviction>,
}

// events for the reporting sink

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Hit,
    Miss(Verdict),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub core: CoreId,
    pub kind: AccessKind,
    pub addr: Addr,
    pub value: Value,
    pub access: Access,
    /// bus sequence number of the transaction behind a miss, `None` for a hit
    pub seq: Option<u64>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AccessKind::Read => write!(f, "Core {} reading from address {}: {}", self.core, self.addr, self.value),
            AccessKind::Write => write!(f, "Core {} writing to address {}: {}", self.core, self.addr, self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_sets(), 2);
    }

    #[test]
    fn config_rejects_zero_and_uneven_ways() {
        for bad in [
            SimConfig { num_cores: 0, ..Default::default() },
            SimConfig { cache_lines: 0, ..Default::default() },
            SimConfig { memory_size: 0, ..Default::default() },
            SimConfig { ways: 0, ..Default::default() },
            SimConfig { cache_lines: 6, ways: 4, ..Default::default() },
        ] {
            assert!(matches!(bad.validate(), Err(SimError::InvalidConfig(_))), "{bad:?}");
        }
    }

    #[test]
    fn event_display_matches_trace_format() {
        let event = Event {
            core: CoreId(1),
            kind: AccessKind::Write,
            addr: Addr(5),
            value: 99,
            access: Access::Hit,
            seq: None,
        };
        assert_eq!(event.to_string(), "Core 1 writing to address 5: 99");
    }
}
