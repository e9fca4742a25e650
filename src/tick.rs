use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const DRIVER_CADENCE_MICROS: u64 = 50;

/// Monotonic tick counter shared by every subsystem. The driver thread
/// advances it at a fixed wall cadence; cores additionally bump it once per
/// executed instruction. Consumers only ever read it.
///
/// Tests skip `start()` and drive time with `advance()` instead.
pub struct TickSource {
    ticks: AtomicU64,
    running: AtomicBool,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TickSource {
    pub fn new() -> Arc<TickSource> {
        Arc::new(TickSource {
            ticks: AtomicU64::new(0),
            running: AtomicBool::new(false),
            driver: Mutex::new(None),
        })
    }

    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn advance(&self, n: u64) -> u64 {
        self.ticks.fetch_add(n, Ordering::AcqRel) + n
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("tick-driver".into())
            .spawn(move || {
                while me.running.load(Ordering::Acquire) {
                    me.ticks.fetch_add(1, Ordering::AcqRel);
                    thread::sleep(Duration::from_micros(DRIVER_CADENCE_MICROS));
                }
            })
            .expect("failed to spawn tick driver");
        *self.driver.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(h) = self.driver.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}

impl Drop for TickSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
