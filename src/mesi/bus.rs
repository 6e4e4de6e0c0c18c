use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, trace};

use super::cache::{CacheLine, PrivateCache};
use super::common::*;
use super::memory::MemoryStore;
use crate::error::{Result, SimError};

/// A private cache as seen from outside its core: the core itself and the
/// bus (during a snoop) both lock it.
pub type SharedCache = Arc<Mutex<PrivateCache>>;

pub(crate) fn lock(cache: &SharedCache) -> Result<MutexGuard<'_, PrivateCache>> {
    cache.lock().map_err(|_| SimError::LockPoisoned)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub read_misses: u64,
    pub write_misses: u64,
    pub upgrades: u64,
    pub peer_supplies: u64,
    pub memory_fills: u64,
    pub invalidations: u64,
    pub snoop_write_backs: u64,
    pub evictions: u64,
    pub eviction_write_backs: u64,
}

impl BusStats {
    pub fn transactions(&self) -> u64 {
        self.read_misses + self.write_misses + self.upgrades
    }
}

/// Checks the MESI sharing rule for one address across all caches: at most
/// one Modified/Exclusive copy, and an owner excludes every other valid copy.
pub fn check_address(caches: &[SharedCache], addr: Addr) -> Result<()> {
    let mut holders = Vec::new();
    for (i, cache) in caches.iter().enumerate() {
        let state = lock(cache)?.state_of(addr);
        if state.is_valid() {
            holders.push((CoreId(i), state));
        }
    }
    let owners = holders.iter().filter(|(_, s)| s.is_owner()).count();
    if owners > 1 || (owners == 1 && holders.len() > 1) {
        return Err(violation(addr, &holders));
    }
    Ok(())
}

fn violation(addr: Addr, holders: &[(CoreId, MesiState)]) -> SimError {
    let detail = holders
        .iter()
        .map(|(id, s)| format!("core {id}: {s}"))
        .collect::<Vec<_>>()
        .join(", ");
    SimError::ProtocolInvariantViolation { address: addr.0, detail }
}

// bus

/// The serialization point of the machine. `execute` resolves one
/// transaction completely (snoops, write-backs, requester install) before it
/// returns, so no transaction ever sees another one half applied.
pub struct CoherenceBus {
    memory: Arc<MemoryStore>,
    caches: Vec<SharedCache>,
    stats: BusStats,
    seq: u64,
}

impl CoherenceBus {
    pub fn new(memory: Arc<MemoryStore>, caches: Vec<SharedCache>) -> Self {
        CoherenceBus { memory, caches, stats: BusStats::default(), seq: 0 }
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn execute(&mut self, tx: BusTransaction) -> Result<Resolution> {
        self.memory.check(tx.addr)?;
        if tx.initiator.0 >= self.caches.len() {
            return Err(SimError::InvalidConfig(format!("no such core {}", tx.initiator)));
        }
        self.seq += 1;
        debug!("bus #{}: core {} {:?} {}", self.seq, tx.initiator, tx.kind, tx.addr);

        let resolution = match tx.kind {
            BusTxKind::ReadMiss => self.read_miss(&tx)?,
            BusTxKind::WriteMiss | BusTxKind::Upgrade => self.read_exclusive(&tx)?,
        };
        if let Err(e) = check_address(&self.caches, tx.addr) {
            error!("bus #{}: {}", self.seq, e);
            return Err(e);
        }
        debug!("bus #{}: resolved {:?} -> {:?}", self.seq, tx.kind, resolution.verdict);
        Ok(resolution)
    }

    // helper functions

    /// Applies `to` to every peer holding a valid copy. A Modified copy is
    /// written back while the peer's lock is still held, so the value that
    /// reaches memory is the last one the peer wrote.
    fn snoop(&mut self, tx: &BusTransaction, to: MesiState) -> Result<Vec<(CoreId, CacheLine)>> {
        let mut holders = Vec::new();
        for (i, cache) in self.caches.iter().enumerate() {
            if i == tx.initiator.0 {
                continue;
            }
            let id = CoreId(i);
            let mut cache = lock(cache)?;
            let snooped = match to {
                MesiState::Invalid => cache.invalidate(tx.addr),
                _ => cache.downgrade(tx.addr, to),
            };
            let Some(before) = snooped else {
                continue;
            };
            if before.state == MesiState::Modified {
                self.memory.write(tx.addr, before.value)?;
                self.stats.snoop_write_backs += 1;
                trace!("core {id}: write back {}={}", tx.addr, before.value);
            }
            trace!("core {id}: {} {} -> {}", tx.addr, before.state, to);
            holders.push((id, before));
        }
        let owners = holders.iter().filter(|(_, l)| l.state.is_owner()).count();
        if owners > 1 || (owners == 1 && holders.len() > 1) {
            let states = holders.iter().map(|(id, l)| (*id, l.state)).collect::<Vec<_>>();
            let e = violation(tx.addr, &states);
            error!("bus #{}: {}", self.seq, e);
            return Err(e);
        }
        Ok(holders)
    }

    fn install(&mut self, tx: &BusTransaction, value: Value, state: MesiState) -> Result<Option<Eviction>> {
        let eviction = lock(&self.caches[tx.initiator.0])?.install(tx.addr, value, state, &self.memory)?;
        if let Some(ev) = &eviction {
            self.stats.evictions += 1;
            if ev.written_back {
                self.stats.eviction_write_backs += 1;
            }
        }
        Ok(eviction)
    }

    fn read_miss(&mut self, tx: &BusTransaction) -> Result<Resolution> {
        self.stats.read_misses += 1;
        let holders = self.snoop(tx, MesiState::Shared)?;
        let mut new_states = holders
            .iter()
            .filter(|(_, l)| l.state != MesiState::Shared)
            .map(|(id, _)| (*id, MesiState::Shared))
            .collect::<BTreeMap<_, _>>();

        let (verdict, supplier, value, state) = match holders.first() {
            Some(&(id, line)) => {
                self.stats.peer_supplies += 1;
                (Verdict::HitFromPeer(id), Some(id), line.value, MesiState::Shared)
            }
            None => {
                self.stats.memory_fills += 1;
                let value = self.memory.read(tx.addr)?;
                (Verdict::HitFromMemory, None, value, MesiState::Exclusive)
            }
        };
        let eviction = self.install(tx, value, state)?;
        new_states.insert(tx.initiator, state);

        Ok(Resolution {
            seq: self.seq,
            verdict,
            supplied_value: supplier.map(|_| value),
            supplier,
            new_states,
            value,
            eviction,
        })
    }

    fn read_exclusive(&mut self, tx: &BusTransaction) -> Result<Resolution> {
        let Some(value) = tx.write_value else {
            return Err(SimError::ProtocolInvariantViolation {
                address: tx.addr.0,
                detail: format!("{:?} from core {} carries no value", tx.kind, tx.initiator),
            });
        };
        match tx.kind {
            BusTxKind::Upgrade => {
                self.stats.upgrades += 1;
                // a peer write may have taken the line since the core looked
                if !lock(&self.caches[tx.initiator.0])?.state_of(tx.addr).is_valid() {
                    debug!("bus #{}: upgrade from core {} lost its line", self.seq, tx.initiator);
                }
            }
            _ => self.stats.write_misses += 1,
        }

        let holders = self.snoop(tx, MesiState::Invalid)?;
        self.stats.invalidations += holders.len() as u64;
        let mut new_states = holders
            .iter()
            .map(|(id, _)| (*id, MesiState::Invalid))
            .collect::<BTreeMap<_, _>>();

        let eviction = self.install(tx, value, MesiState::Modified)?;
        new_states.insert(tx.initiator, MesiState::Modified);

        Ok(Resolution {
            seq: self.seq,
            verdict: Verdict::FreshExclusive,
            supplied_value: None,
            supplier: None,
            new_states,
            value,
            eviction,
        })
    }

    // worker

    /// Moves the bus onto its own thread. Cores talk to it through the
    /// returned handle; the thread exits once every handle is dropped.
    pub fn spawn(self) -> Result<(BusHandle, JoinHandle<Result<BusStats>>)> {
        let (requests, incoming) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name("coherence-bus".into())
            .spawn(move || self.run(incoming))
            .map_err(SimError::Spawn)?;
        Ok((BusHandle { requests }, worker))
    }

    fn run(mut self, incoming: Receiver<BusRequest>) -> Result<BusStats> {
        let mut fatal = None;
        for req in incoming.iter() {
            if fatal.is_some() {
                let _ = req.reply.send(Err(SimError::BusClosed));
                continue;
            }
            let result = self.execute(req.tx);
            if let Err(SimError::ProtocolInvariantViolation { address, detail }) = &result {
                fatal = Some(SimError::ProtocolInvariantViolation {
                    address: *address,
                    detail: detail.clone(),
                });
            }
            // the requester only goes away if its thread died
            let _ = req.reply.send(result);
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }
}

struct BusRequest {
    tx: BusTransaction,
    reply: Sender<Result<Resolution>>,
}

/// A core's connection to the bus worker.
#[derive(Clone)]
pub struct BusHandle {
    requests: Sender<BusRequest>,
}

impl BusHandle {
    /// Blocks until the bus has resolved `tx`.
    pub fn execute(&self, tx: BusTransaction) -> Result<Resolution> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.requests
            .send(BusRequest { tx, reply })
            .map_err(|_| SimError::BusClosed)?;
        response.recv().map_err(|_| SimError::BusClosed)?
    }
}
