use crossbeam_channel::Sender;
use log::{debug, info, warn};

use super::bus::{lock, BusHandle, SharedCache};
use super::common::*;
use crate::error::{Result, SimError};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreStats {
    pub executed: u64,
    pub reads: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub upgrades: u64,
}

#[derive(Debug)]
pub struct CoreReport {
    pub id: CoreId,
    pub stats: CoreStats,
    /// why the stream stopped early, if it did
    pub error: Option<SimError>,
}

/// value seen or written, how it was satisfied, and the bus sequence number
type Outcome = (Value, Access, Option<u64>);

/// Executes one core's instruction stream against its private cache, going
/// to the bus whenever the local line cannot satisfy the access.
pub struct Processor {
    pub id: CoreId,
    cache: SharedCache,
    bus: BusHandle,
    memory_size: usize,
    stats: CoreStats,
}

impl Processor {
    pub fn new(id: CoreId, cache: SharedCache, bus: BusHandle, memory_size: usize) -> Self {
        Processor {
            id,
            cache,
            bus,
            memory_size,
            stats: CoreStats::default(),
        }
    }

    pub fn stats(&self) -> &CoreStats {
        &self.stats
    }

    /// Executes a single instruction. Blocks only while the bus resolves a
    /// transaction on this core's behalf.
    pub fn step(&mut self, instr: Instr) -> Result<Event> {
        let addr = instr.addr();
        if addr.0 >= self.memory_size {
            return Err(SimError::AddressOutOfRange {
                address: addr.0,
                memory_size: self.memory_size,
            });
        }
        let (value, access, seq) = match instr {
            Instr::Read(addr) => self.read(addr)?,
            Instr::Write(addr, value) => self.write(addr, value)?,
        };
        let kind = instr.kind();
        match kind {
            AccessKind::Read => self.stats.reads += 1,
            AccessKind::Write => self.stats.writes += 1,
        }
        if access == Access::Hit {
            self.stats.hits += 1;
        }
        self.stats.executed += 1;
        Ok(Event { core: self.id, kind, addr, value, access, seq })
    }

    fn resolve(&mut self, tx: BusTransaction) -> Result<Outcome> {
        let res = self.bus.execute(tx)?;
        match tx.kind {
            BusTxKind::Upgrade => self.stats.upgrades += 1,
            _ => self.stats.misses += 1,
        }
        Ok((res.value, Access::Miss(res.verdict), Some(res.seq)))
    }

    fn read(&mut self, addr: Addr) -> Result<Outcome> {
        if let Some(value) = lock(&self.cache)?.read(addr) {
            return Ok((value, Access::Hit, None));
        }
        self.resolve(BusTransaction::read_miss(self.id, addr))
    }

    fn write(&mut self, addr: Addr, value: Value) -> Result<Outcome> {
        let state = {
            let mut cache = lock(&self.cache)?;
            if cache.write_modified(addr, value) {
                return Ok((value, Access::Hit, None));
            }
            cache.state_of(addr)
        };
        let tx = if state.is_valid() {
            // Exclusive or Shared: peers must drop their copies first
            BusTransaction::upgrade(self.id, addr, value)
        } else {
            BusTransaction::write_miss(self.id, addr, value)
        };
        self.resolve(tx)
    }

    /// Drains `insts`, reporting one event per instruction to `sink`. The
    /// first error ends this core's stream; the other cores keep running.
    pub fn run<I>(mut self, insts: I, sink: &Sender<Event>) -> CoreReport
    where
        I: IntoIterator<Item = Instr>,
    {
        info!("core {} starting", self.id);
        let mut error = None;
        for instr in insts {
            match self.step(instr) {
                Ok(event) => {
                    if sink.send(event).is_err() {
                        debug!("core {}: event sink closed", self.id);
                    }
                }
                Err(e) => {
                    warn!("core {} stopped at {:?}: {}", self.id, instr, e);
                    error = Some(e);
                    break;
                }
            }
        }
        info!("core {} finished after {} instructions", self.id, self.stats.executed);
        CoreReport { id: self.id, stats: self.stats, error }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::mesi::bus::CoherenceBus;
    use crate::mesi::cache::PrivateCache;
    use crate::mesi::memory::MemoryStore;

    fn single_core(lines: usize, mem: usize) -> (Processor, SharedCache, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new(mem));
        let cache: SharedCache = Arc::new(Mutex::new(PrivateCache::direct_mapped(lines).unwrap()));
        let (bus, _worker) = CoherenceBus::new(memory.clone(), vec![cache.clone()]).spawn().unwrap();
        (Processor::new(CoreId(0), cache.clone(), bus, mem), cache, memory)
    }

    #[test]
    fn read_miss_then_hit() {
        let (mut p, cache, memory) = single_core(2, 24);
        memory.write(Addr(3), 12).unwrap();
        let first = p.step(Instr::Read(Addr(3))).unwrap();
        assert_eq!(first.value, 12);
        assert_eq!(first.access, Access::Miss(Verdict::HitFromMemory));
        let second = p.step(Instr::Read(Addr(3))).unwrap();
        assert_eq!(second.access, Access::Hit);
        // a local read keeps the line Exclusive
        assert_eq!(cache.lock().unwrap().state_of(Addr(3)), MesiState::Exclusive);
        assert_eq!(p.stats().hits, 1);
        assert_eq!(p.stats().misses, 1);
    }

    #[test]
    fn write_hit_on_modified_stays_local() {
        let (mut p, cache, memory) = single_core(2, 24);
        p.step(Instr::Write(Addr(1), 5)).unwrap();
        let ev = p.step(Instr::Write(Addr(1), 6)).unwrap();
        assert_eq!(ev.access, Access::Hit);
        assert_eq!(cache.lock().unwrap().lookup(Addr(1)).unwrap().value, 6);
        assert_eq!(memory.read(Addr(1)).unwrap(), 0);
        assert_eq!(p.step(Instr::Read(Addr(1))).unwrap().value, 6);
    }

    #[test]
    fn write_on_exclusive_upgrades() {
        let (mut p, cache, _) = single_core(2, 24);
        p.step(Instr::Read(Addr(0))).unwrap();
        let ev = p.step(Instr::Write(Addr(0), 3)).unwrap();
        assert_eq!(ev.access, Access::Miss(Verdict::FreshExclusive));
        assert_eq!(cache.lock().unwrap().state_of(Addr(0)), MesiState::Modified);
        assert_eq!(p.stats().upgrades, 1);
    }

    #[test]
    fn out_of_range_stops_the_stream() {
        let (p, cache, _) = single_core(2, 24);
        let (tx, rx) = crossbeam_channel::unbounded();
        let report = p.run(
            vec![Instr::Write(Addr(2), 1), Instr::Read(Addr(24)), Instr::Read(Addr(2))],
            &tx,
        );
        drop(tx);
        assert!(matches!(report.error, Some(SimError::AddressOutOfRange { address: 24, memory_size: 24 })));
        assert_eq!(report.stats.executed, 1);
        assert_eq!(rx.iter().count(), 1);
        // shared state untouched by the faulting instruction
        assert_eq!(cache.lock().unwrap().state_of(Addr(2)), MesiState::Modified);
    }

    #[test]
    fn exhausted_stream_finishes_cleanly() {
        let (p, _, _) = single_core(2, 24);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let report = p.run(Vec::new(), &tx);
        assert!(report.error.is_none());
        assert_eq!(report.stats, CoreStats::default());
    }

    #[test]
    fn failed_transactions_are_not_counted() {
        let memory = Arc::new(MemoryStore::new(24));
        let caches = (0..3)
            .map(|_| Arc::new(Mutex::new(PrivateCache::direct_mapped(2).unwrap())))
            .collect::<Vec<SharedCache>>();
        // two owners of 5 behind the bus's back
        for c in &caches[1..] {
            c.lock().unwrap().install(Addr(5), 1, MesiState::Modified, &memory).unwrap();
        }
        let (bus, _worker) = CoherenceBus::new(memory, caches.clone()).spawn().unwrap();
        let mut p = Processor::new(CoreId(0), caches[0].clone(), bus, 24);

        assert!(matches!(
            p.step(Instr::Read(Addr(5))),
            Err(SimError::ProtocolInvariantViolation { address: 5, .. })
        ));
        assert!(matches!(p.step(Instr::Write(Addr(2), 1)), Err(SimError::BusClosed)));
        assert_eq!(p.stats(), &CoreStats::default());
    }

    #[test]
    fn miss_events_carry_the_bus_sequence() {
        let (mut p, _, _) = single_core(2, 24);
        let first = p.step(Instr::Write(Addr(4), 1)).unwrap();
        let hit = p.step(Instr::Read(Addr(4))).unwrap();
        let second = p.step(Instr::Read(Addr(7))).unwrap();
        assert_eq!(first.seq, Some(1));
        assert_eq!(hit.seq, None);
        assert_eq!(second.seq, Some(2));
        assert_eq!((p.stats().reads, p.stats().writes), (2, 1));
    }
}
