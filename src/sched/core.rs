use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::error;

use super::scheduler::Scheduler;
use crate::exec::{Process, StepOutcome};
use crate::tick::TickSource;

/// One serial execution context. A core holds at most one process and runs
/// it on its own worker thread for up to `quantum` instructions, bumping the
/// global tick once per retired instruction.
pub struct Core {
    id: usize,
    delay_per_exec: u64,
    tick: Arc<TickSource>,
    busy: AtomicBool,
    running: Mutex<Option<Arc<Process>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    ticks_used: AtomicU64,
}

impl Core {
    pub fn new(id: usize, delay_per_exec: u64, tick: Arc<TickSource>) -> Arc<Core> {
        Arc::new(Core {
            id,
            delay_per_exec,
            tick,
            busy: AtomicBool::new(false),
            running: Mutex::new(None),
            worker: Mutex::new(None),
            ticks_used: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// The process currently assigned, if the core is busy.
    pub fn running_process(&self) -> Option<Arc<Process>> {
        if self.is_busy() {
            self.running.lock().unwrap().clone()
        } else {
            None
        }
    }

    /// Busy ticks this core has accumulated over its lifetime.
    pub fn ticks_used(&self) -> u64 {
        self.ticks_used.load(Ordering::Acquire)
    }

    /// Requests a graceful stop; the worker exits at the next instruction
    /// boundary.
    pub fn stop(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn join(&self) {
        if let Some(h) = self.worker.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    /// Claims the core for `process`. Rejected when the core is already
    /// busy; on success the worker thread starts immediately.
    pub fn try_assign(
        self: &Arc<Self>,
        scheduler: &Arc<Scheduler>,
        process: Arc<Process>,
        quantum: u64,
    ) -> bool {
        if self.busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        // the previous worker has cleared busy, so it is done; reap it
        if let Some(h) = self.worker.lock().unwrap().take() {
            let _ = h.join();
        }
        *self.running.lock().unwrap() = Some(Arc::clone(&process));
        process.note_dispatch(self.id);

        let core = Arc::clone(self);
        let sched = Arc::clone(scheduler);
        let spawned = thread::Builder::new()
            .name(format!("core-{}", self.id))
            .spawn(move || core.worker_loop(sched, process, quantum));
        match spawned {
            Ok(h) => {
                *self.worker.lock().unwrap() = Some(h);
                true
            }
            Err(e) => {
                error!("core {}: failed to start worker: {}", self.id, e);
                *self.running.lock().unwrap() = None;
                self.busy.store(false, Ordering::Release);
                false
            }
        }
    }

    fn worker_loop(self: Arc<Self>, scheduler: Arc<Scheduler>, process: Arc<Process>, quantum: u64) {
        let mut executed: u64 = 0;

        while self.busy.load(Ordering::Acquire) && !process.is_terminal() && executed < quantum {
            if process.is_sleeping() {
                break;
            }
            match process.step(self.id) {
                Ok(StepOutcome::Idle) => break,
                Err(_) => break, // violation or OOM; the process is marked
                Ok(_) => {}
            }
            // one instruction retired
            self.tick.advance(1);
            self.ticks_used.fetch_add(1, Ordering::AcqRel);
            executed += 1;
            self.pace();
        }

        // vacate the slot before handing the process anywhere else so it is
        // never observable in two places at once
        *self.running.lock().unwrap() = None;
        if process.is_terminal() {
            scheduler.add_finished(&process);
        } else {
            // sleeping, quantum expired, or a graceful stop
            scheduler.requeue(process);
        }
        self.busy.store(false, Ordering::Release);
    }

    /// Per-instruction pacing: yield briefly at delay 0, otherwise stall
    /// until the global tick has moved `delay_per_exec` past the retire.
    fn pace(&self) {
        if self.delay_per_exec == 0 {
            thread::sleep(Duration::from_millis(1));
        } else {
            let target = self.tick.now() + self.delay_per_exec;
            while self.tick.now() < target && self.busy.load(Ordering::Acquire) {
                thread::yield_now();
            }
        }
    }
}
