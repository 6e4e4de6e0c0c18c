use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::info;

use crate::error::{Result, SimError};
use crate::mesi::*;

pub struct SimReport {
    /// every processed instruction, per core in program order, misses in
    /// bus order
    pub events: Vec<Event>,
    pub cores: Vec<CoreReport>,
    pub bus: BusStats,
    pub memory: Vec<Value>,
    pub caches: Vec<Vec<CacheLine>>,
}

/// Owns the memory and the private caches of one simulated machine. They
/// live as long as the `Simulation` does; bus and core workers only borrow
/// them through `Arc`s for the duration of a run.
pub struct Simulation {
    config: SimConfig,
    memory: Arc<MemoryStore>,
    caches: Vec<SharedCache>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let caches = (0..config.num_cores)
            .map(|_| Ok(Arc::new(Mutex::new(PrivateCache::new(config.cache_lines, config.ways)?))))
            .collect::<Result<Vec<SharedCache>>>()?;
        Ok(Simulation {
            config,
            memory: Arc::new(MemoryStore::new(config.memory_size)),
            caches,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    fn cache(&self, core: CoreId) -> Result<&SharedCache> {
        self.caches
            .get(core.0)
            .ok_or_else(|| SimError::InvalidConfig(format!("no such core {core}")))
    }

    pub fn cache_lines(&self, core: CoreId) -> Result<Vec<CacheLine>> {
        let cache = self.cache(core)?;
        let lines = cache.lock().map_err(|_| SimError::LockPoisoned)?.lines().to_vec();
        Ok(lines)
    }

    pub fn state_of(&self, core: CoreId, addr: Addr) -> Result<MesiState> {
        let cache = self.cache(core)?;
        let state = cache.lock().map_err(|_| SimError::LockPoisoned)?.state_of(addr);
        Ok(state)
    }

    /// Starts a bus worker over this machine's memory and caches.
    pub fn start_bus(&self) -> Result<(BusHandle, JoinHandle<Result<BusStats>>)> {
        CoherenceBus::new(self.memory.clone(), self.caches.clone()).spawn()
    }

    pub fn processor(&self, core: CoreId, bus: BusHandle) -> Result<Processor> {
        let cache = self.cache(core)?.clone();
        Ok(Processor::new(core, cache, bus, self.config.memory_size))
    }

    /// Audits every cached address. Meaningful only between transactions.
    pub fn check_coherence(&self) -> Result<()> {
        let mut addrs = BTreeSet::new();
        for core in 0..self.caches.len() {
            for line in self.cache_lines(CoreId(core))? {
                if let (Some(addr), true) = (line.addr, line.state.is_valid()) {
                    addrs.insert(addr);
                }
            }
        }
        addrs.into_iter().try_for_each(|addr| check_address(&self.caches, addr))
    }

    pub fn run(&self, streams: Vec<Insts>) -> Result<SimReport> {
        self.run_with(streams, |_| {})
    }

    /// Runs one worker per core until every stream is exhausted or faulted,
    /// calling `on_event` on this thread as events arrive.
    pub fn run_with<F>(&self, streams: Vec<Insts>, mut on_event: F) -> Result<SimReport>
    where
        F: FnMut(&Event),
    {
        let n = self.config.num_cores;
        if streams.len() > n {
            return Err(SimError::InvalidConfig(format!(
                "{} instruction streams for {} cores",
                streams.len(),
                n
            )));
        }
        info!("starting simulation: {:?}", self.config);

        let (bus, bus_worker) = self.start_bus()?;
        let (sink, events_rx) = crossbeam_channel::unbounded();
        let mut streams = streams.into_iter();

        let (events, cores) = thread::scope(move |s| -> Result<_> {
            let mut workers = Vec::with_capacity(n);
            for i in 0..n {
                let insts = streams.next().unwrap_or_default();
                let processor = self.processor(CoreId(i), bus.clone())?;
                let sink = sink.clone();
                let worker = thread::Builder::new()
                    .name(format!("core-{i}"))
                    .spawn_scoped(s, move || processor.run(insts, &sink))
                    .map_err(SimError::Spawn)?;
                workers.push(worker);
            }
            // only the workers keep the bus and the sink alive from here on
            drop(bus);
            drop(sink);

            let mut events = Vec::new();
            let mut emit = |event: Event| {
                on_event(&event);
                events.push(event);
            };
            let mut order = BusOrder::new(n);
            for event in events_rx.iter() {
                order.push(event, &mut emit);
            }
            order.finish(&mut emit);
            let cores = workers
                .into_iter()
                .enumerate()
                .map(|(i, w)| w.join().map_err(|_| SimError::WorkerPanicked(format!("core-{i}"))))
                .collect::<Result<Vec<_>>>()?;
            Ok((events, cores))
        })?;

        let bus = bus_worker
            .join()
            .map_err(|_| SimError::WorkerPanicked("coherence-bus".into()))??;
        info!("simulation finished: {} bus transactions", bus.transactions());

        let caches = (0..n)
            .map(|i| self.cache_lines(CoreId(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(SimReport {
            events,
            cores,
            bus,
            memory: self.memory.snapshot(),
            caches,
        })
    }
}

/// Holds events back until they can be released in bus order. Each core's
/// events arrive in program order; a miss waits for every transaction with a
/// lower sequence number, and a hit only for the events ahead of it.
struct BusOrder {
    pending: Vec<VecDeque<Event>>,
    next_seq: u64,
}

impl BusOrder {
    fn new(num_cores: usize) -> Self {
        BusOrder { pending: vec![VecDeque::new(); num_cores], next_seq: 1 }
    }

    fn push<F: FnMut(Event)>(&mut self, event: Event, emit: &mut F) {
        self.pending[event.core.0].push_back(event);
        self.release(emit);
    }

    fn release<F: FnMut(Event)>(&mut self, emit: &mut F) {
        let mut progressed = true;
        while progressed {
            progressed = false;
            for queue in self.pending.iter_mut() {
                while let Some(seq) = queue.front().map(|e| e.seq) {
                    match seq {
                        Some(seq) if seq != self.next_seq => break,
                        Some(_) => self.next_seq += 1,
                        None => {}
                    }
                    if let Some(event) = queue.pop_front() {
                        emit(event);
                    }
                    progressed = true;
                }
            }
        }
    }

    /// Flushes what is left once every core is done. A transaction that
    /// failed consumed a sequence number without producing an event, so
    /// the gaps are skipped here.
    fn finish<F: FnMut(Event)>(mut self, emit: &mut F) {
        loop {
            self.release(emit);
            let lowest = self.pending.iter().filter_map(|q| q.front().and_then(|e| e.seq)).min();
            match lowest {
                Some(seq) => self.next_seq = seq,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim(num_cores: usize) -> Simulation {
        Simulation::new(SimConfig { num_cores, ..Default::default() }).unwrap()
    }

    #[test]
    fn rejects_bad_config_and_extra_streams() {
        assert!(Simulation::new(SimConfig { num_cores: 0, ..Default::default() }).is_err());
        let s = sim(1);
        assert!(matches!(s.run(vec![vec![], vec![]]), Err(SimError::InvalidConfig(_))));
        assert!(s.cache_lines(CoreId(1)).is_err());
    }

    #[test]
    fn missing_streams_are_empty() {
        let s = sim(3);
        let report = s.run(vec![vec![Instr::Write(Addr(1), 2)]]).unwrap();
        assert_eq!(report.cores.len(), 3);
        assert_eq!(report.events.len(), 1);
        assert!(report.cores.iter().all(|c| c.error.is_none()));
        assert_eq!(report.caches.len(), 3);
    }

    #[test]
    fn run_reports_events_in_program_order_per_core() {
        let s = sim(2);
        let streams = vec![
            (0..10).map(|i| Instr::Write(Addr(i), i as Value)).collect::<Vec<_>>(),
            (0..10).map(|i| Instr::Read(Addr(23 - i))).collect::<Vec<_>>(),
        ];
        let mut seen = 0;
        let report = s.run_with(streams, |_| seen += 1).unwrap();
        assert_eq!(seen, 20);
        for core in 0..2 {
            let addrs = report
                .events
                .iter()
                .filter(|e| e.core == CoreId(core))
                .map(|e| e.addr.0)
                .collect::<Vec<_>>();
            let expected = if core == 0 { (0..10).collect::<Vec<_>>() } else { (14..24).rev().collect() };
            assert_eq!(addrs, expected);
        }
        s.check_coherence().unwrap();
    }

    #[test]
    fn faulting_core_does_not_stop_peers() {
        let s = sim(2);
        let report = s
            .run(vec![
                vec![Instr::Write(Addr(30), 1), Instr::Write(Addr(0), 1)],
                vec![Instr::Write(Addr(3), 4), Instr::Read(Addr(3))],
            ])
            .unwrap();
        assert!(matches!(report.cores[0].error, Some(SimError::AddressOutOfRange { address: 30, .. })));
        assert_eq!(report.cores[0].stats.executed, 0);
        assert!(report.cores[1].error.is_none());
        assert_eq!(report.cores[1].stats.executed, 2);
        assert_eq!(s.state_of(CoreId(1), Addr(3)).unwrap(), MesiState::Modified);
    }

    fn miss(core: usize, seq: u64) -> Event {
        Event {
            core: CoreId(core),
            kind: AccessKind::Read,
            addr: Addr(0),
            value: seq,
            access: Access::Miss(Verdict::HitFromMemory),
            seq: Some(seq),
        }
    }

    fn hit(core: usize) -> Event {
        Event { access: Access::Hit, seq: None, ..miss(core, 0) }
    }

    #[test]
    fn late_miss_is_held_until_earlier_transactions_are_out() {
        let mut order = BusOrder::new(2);
        let mut out = Vec::new();
        let mut emit = |e: Event| out.push((e.core.0, e.seq));
        // core 1 reports seq 2 before core 0 gets to report seq 1
        order.push(miss(1, 2), &mut emit);
        order.push(hit(1), &mut emit);
        order.push(miss(0, 1), &mut emit);
        order.push(hit(0), &mut emit);
        order.finish(&mut emit);
        assert_eq!(out, vec![(0, Some(1)), (1, Some(2)), (1, None), (0, None)]);
    }

    #[test]
    fn sequence_gaps_are_flushed_at_the_end() {
        let mut order = BusOrder::new(2);
        let mut out = Vec::new();
        let mut emit = |e: Event| out.push(e.seq);
        // seq 2 failed and never produced an event
        order.push(miss(0, 3), &mut emit);
        order.push(miss(1, 1), &mut emit);
        order.push(miss(1, 4), &mut emit);
        order.finish(&mut emit);
        assert_eq!(out, vec![Some(1), Some(3), Some(4)]);
    }

    #[test]
    fn reported_misses_follow_bus_order() {
        let s = Simulation::new(SimConfig { num_cores: 4, cache_lines: 2, ways: 1, memory_size: 4 }).unwrap();
        let streams = (0..4)
            .map(|core| {
                (0..200)
                    .map(|n| if (n + core) % 2 == 0 { Instr::Write(Addr(n % 4), n as Value) } else { Instr::Read(Addr(n % 4)) })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let mut seen = Vec::new();
        let report = s.run_with(streams, |e| seen.extend(e.seq)).unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        assert_eq!(seen.len() as u64, report.bus.transactions());
        assert_eq!(report.events.len(), 800);
    }
}
