use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use chrono::Local;
use log::{debug, info};

use super::core::Core;
use super::queue::ReadyQueue;
use crate::config::{Config, SchedulerKind};
use crate::exec::{gen, Process};
use crate::mem::MemoryManager;
use crate::tick::TickSource;

/// Doze between dispatch (and generator) sweeps to bound CPU use.
const LOOP_DOZE: Duration = Duration::from_millis(10);

struct FinishedList {
    list: Vec<Arc<Process>>,
    /// Guards against a core and the dispatch sweep both retiring the same
    /// process.
    ids: HashSet<u64>,
}

/// Global queue discipline: owns the cores, the ready/sleeping/finished
/// lists, the pid allocator and the batch generator. One dedicated thread
/// dispatches; each core runs its assignment on its own worker thread.
pub struct Scheduler {
    kind: SchedulerKind,
    quantum_cycles: u64,
    batch_process_freq: u64,
    min_ins: u64,
    max_ins: u64,
    min_mem_per_proc: usize,
    max_mem_per_proc: usize,

    cores: Vec<Arc<Core>>,
    ready: ReadyQueue<Arc<Process>>,
    sleeping: Mutex<Vec<Arc<Process>>>,
    finished: Mutex<FinishedList>,
    /// pid -> process, non-owning. This is what eviction uses to reach any
    /// admitted process, wherever it currently sits.
    registry: Mutex<HashMap<u64, Weak<Process>>>,

    active_count: AtomicI64,
    submitted_count: AtomicU64,
    next_pid: AtomicU64,
    next_core_index: AtomicUsize,
    last_snapshot_tick: AtomicU64,

    running: AtomicBool,
    gen_enabled: AtomicBool,
    dispatch_thread: Mutex<Option<thread::JoinHandle<()>>>,
    gen_thread: Mutex<Option<thread::JoinHandle<()>>>,

    memory: Arc<MemoryManager>,
    tick: Arc<TickSource>,
}

impl Scheduler {
    pub fn new(cfg: &Config, memory: Arc<MemoryManager>, tick: Arc<TickSource>) -> Arc<Scheduler> {
        let cores = (0..cfg.num_cpu as usize)
            .map(|i| Core::new(i, cfg.delay_per_exec, Arc::clone(&tick)))
            .collect();
        Arc::new(Scheduler {
            kind: cfg.scheduler,
            quantum_cycles: cfg.quantum_cycles,
            batch_process_freq: cfg.batch_process_freq,
            min_ins: cfg.min_ins,
            max_ins: cfg.max_ins,
            min_mem_per_proc: cfg.min_mem_per_proc,
            max_mem_per_proc: cfg.max_mem_per_proc,
            cores,
            ready: ReadyQueue::new(),
            sleeping: Mutex::new(Vec::new()),
            finished: Mutex::new(FinishedList {
                list: Vec::new(),
                ids: HashSet::new(),
            }),
            registry: Mutex::new(HashMap::new()),
            active_count: AtomicI64::new(0),
            submitted_count: AtomicU64::new(0),
            next_pid: AtomicU64::new(1),
            next_core_index: AtomicUsize::new(0),
            last_snapshot_tick: AtomicU64::new(0),
            running: AtomicBool::new(false),
            gen_enabled: AtomicBool::new(false),
            dispatch_thread: Mutex::new(None),
            gen_thread: Mutex::new(None),
            memory,
            tick,
        })
    }

    pub fn next_pid(&self) -> u64 {
        self.next_pid.fetch_add(1, Ordering::AcqRel)
    }

    pub fn active_count(&self) -> i64 {
        self.active_count.load(Ordering::Acquire)
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted_count.load(Ordering::Acquire)
    }

    /// Admits a fully constructed process: it becomes reachable for eviction
    /// and eligible for dispatch.
    pub fn submit(&self, p: Arc<Process>) {
        self.registry
            .lock()
            .unwrap()
            .insert(p.pid(), Arc::downgrade(&p));
        self.active_count.fetch_add(1, Ordering::AcqRel);
        self.submitted_count.fetch_add(1, Ordering::AcqRel);
        debug!("submitted pid {} ({})", p.pid(), p.name());
        self.ready.push(p);
    }

    /// Returns a preempted or sleeping process to the right list.
    pub fn requeue(&self, p: Arc<Process>) {
        if p.is_sleeping() {
            self.sleeping.lock().unwrap().push(p);
        } else {
            self.ready.push(p);
        }
    }

    /// Retires a terminal process exactly once: stamps the finish time,
    /// releases its memory and takes it out of the active population.
    pub fn add_finished(&self, p: &Arc<Process>) {
        let mut fin = self.finished.lock().unwrap();
        if fin.ids.insert(p.pid()) {
            p.mark_finish_time(Local::now());
            self.memory.deallocate(p.pid());
            fin.list.push(Arc::clone(p));
            self.active_count.fetch_sub(1, Ordering::AcqRel);
            debug!("finished pid {} ({})", p.pid(), p.name());
        }
    }

    pub fn find_by_pid(&self, pid: u64) -> Option<Arc<Process>> {
        self.registry.lock().unwrap().get(&pid).and_then(Weak::upgrade)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Process>> {
        self.registry
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .find(|p| p.name() == name)
    }

    pub fn running_processes(&self) -> Vec<Arc<Process>> {
        self.cores
            .iter()
            .filter_map(|c| c.running_process())
            .collect()
    }

    pub fn sleeping_processes(&self) -> Vec<Arc<Process>> {
        self.sleeping.lock().unwrap().clone()
    }

    pub fn finished_processes(&self) -> Vec<Arc<Process>> {
        self.finished.lock().unwrap().list.clone()
    }

    pub fn cores(&self) -> &[Arc<Core>] {
        &self.cores
    }

    pub fn cores_used(&self) -> usize {
        self.cores.iter().filter(|c| c.is_busy()).count()
    }

    pub fn cores_available(&self) -> usize {
        self.cores.len() - self.cores_used()
    }

    pub fn cpu_utilization(&self) -> f64 {
        if self.cores.is_empty() {
            return 0.0;
        }
        self.cores_used() as f64 / self.cores.len() as f64 * 100.0
    }

    /// Busy ticks across all cores, for the vmstat active/idle split.
    pub fn active_cpu_ticks(&self) -> u64 {
        self.cores.iter().map(|c| c.ticks_used()).sum()
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("dispatch".into())
            .spawn(move || me.dispatch_loop())
            .expect("failed to spawn dispatch thread");
        *self.dispatch_thread.lock().unwrap() = Some(handle);
    }

    /// Directs every core to stop and joins all scheduler-owned threads.
    pub fn stop(&self) {
        for core in &self.cores {
            core.stop();
        }
        self.running.store(false, Ordering::Release);
        self.gen_enabled.store(false, Ordering::Release);
        if let Some(h) = self.dispatch_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.gen_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        for core in &self.cores {
            core.join();
        }
        info!("scheduler stopped");
    }

    /// Blocks until every admitted process has been retired.
    pub fn wait_until_done(&self) {
        while self.active_count() > 0 {
            thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn start_generation(self: &Arc<Self>) {
        if self.gen_enabled.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("batch-gen".into())
            .spawn(move || me.generator_loop())
            .expect("failed to spawn generator thread");
        *self.gen_thread.lock().unwrap() = Some(handle);
    }

    pub fn stop_generation(&self) {
        self.gen_enabled.store(false, Ordering::Release);
        if let Some(h) = self.gen_thread.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    pub fn generation_enabled(&self) -> bool {
        self.gen_enabled.load(Ordering::Acquire)
    }

    fn dispatch_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            self.wake_sleepers();
            self.assign_ready();
            self.sweep_finished();
            self.snapshot_on_cadence();
            thread::sleep(LOOP_DOZE);
        }
    }

    /// Moves every sleeper whose wake tick has passed back to the ready
    /// queue.
    fn wake_sleepers(&self) {
        let now = self.tick.now();
        let mut sleeping = self.sleeping.lock().unwrap();
        let mut i = 0;
        while i < sleeping.len() {
            if sleeping[i].try_wake(now) {
                let p = sleeping.remove(i);
                self.ready.push(p);
            } else {
                i += 1;
            }
        }
    }

    /// Hands ready processes to idle cores, round-robin from the rotation
    /// hint. FCFS runs to completion; RR gets one quantum.
    fn assign_ready(self: &Arc<Self>) {
        let n = self.cores.len();
        let start = self.next_core_index.load(Ordering::Acquire);
        for i in 0..n {
            let core = &self.cores[(start + i) % n];
            if core.is_busy() {
                continue;
            }
            let p = match self.ready.try_pop() {
                Some(p) => p,
                None => break,
            };
            let quantum = match self.kind {
                SchedulerKind::RoundRobin => self.quantum_cycles,
                SchedulerKind::Fcfs => u64::MAX,
            };
            if core.try_assign(self, Arc::clone(&p), quantum) {
                self.next_core_index
                    .store((core.id() + 1) % n, Ordering::Release);
            } else {
                // the core got claimed between the check and the assign
                self.ready.push(p);
            }
        }
    }

    fn sweep_finished(&self) {
        for core in &self.cores {
            if let Some(p) = core.running_process() {
                if p.is_terminal() {
                    self.add_finished(&p);
                }
            }
        }
    }

    fn snapshot_on_cadence(&self) {
        let now = self.tick.now();
        let last = self.last_snapshot_tick.load(Ordering::Acquire);
        if self.quantum_cycles > 0 && now.saturating_sub(last) >= self.quantum_cycles {
            self.memory.snapshot();
            self.last_snapshot_tick.store(now, Ordering::Release);
        }
    }

    /// Mints `p<pid>` processes with random programs on the configured tick
    /// cadence.
    fn generator_loop(self: Arc<Self>) {
        let mut last_gen = self.tick.now();
        while self.gen_enabled.load(Ordering::Acquire) {
            let now = self.tick.now();
            if now >= last_gen + self.batch_process_freq {
                self.spawn_batch_process();
                last_gen = now;
            }
            thread::sleep(LOOP_DOZE);
        }
    }

    fn spawn_batch_process(self: &Arc<Self>) {
        let pid = self.next_pid();
        let name = format!("p{}", pid);
        let mem_bytes = gen::random_mem_size(self.min_mem_per_proc, self.max_mem_per_proc);
        let p = Process::new(pid, name, Arc::clone(&self.memory), Arc::clone(&self.tick));
        self.memory.allocate(&p, mem_bytes);
        p.load_program(gen::random_program(self.min_ins, self.max_ins, mem_bytes));
        self.submit(p);
    }
}
