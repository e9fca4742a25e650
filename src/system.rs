use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use log::info;

use crate::config::{is_valid_proc_mem_size, Config};
use crate::exec::{gen, script, ProcStatus, Process};
use crate::mem::MemoryManager;
use crate::sched::Scheduler;
use crate::tick::TickSource;

/// Where the emulator writes its persisted state. Tests point these at temp
/// directories.
#[derive(Debug, Clone)]
pub struct SystemPaths {
    pub backing_log: PathBuf,
    pub snapshot: PathBuf,
    pub report: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> SystemPaths {
        SystemPaths {
            backing_log: PathBuf::from("osim-backing-store.txt"),
            snapshot: PathBuf::from("osim-vmstat.txt"),
            report: PathBuf::from("osim-report.txt"),
        }
    }
}

/// The wired emulator: tick source, memory manager and scheduler, plus the
/// control surface the shell talks to.
pub struct System {
    cfg: Config,
    paths: SystemPaths,
    tick: Arc<TickSource>,
    memory: Arc<MemoryManager>,
    scheduler: Arc<Scheduler>,
}

impl System {
    pub fn boot(cfg: Config) -> System {
        System::boot_with_paths(cfg, SystemPaths::default())
    }

    pub fn boot_with_paths(cfg: Config, paths: SystemPaths) -> System {
        let tick = TickSource::new();
        let memory = Arc::new(MemoryManager::new(
            cfg.max_overall_mem,
            cfg.mem_per_frame,
            &paths.backing_log,
            &paths.snapshot,
        ));
        let scheduler = Scheduler::new(&cfg, Arc::clone(&memory), Arc::clone(&tick));

        // eviction resolves page owners through the scheduler's registry;
        // the closure holds it weakly to keep ownership one-directional
        let weak = Arc::downgrade(&scheduler);
        memory.set_owner_lookup(Box::new(move |pid| {
            weak.upgrade().and_then(|s| s.find_by_pid(pid))
        }));

        tick.start();
        scheduler.start();
        info!("system booted with {} cores", cfg.num_cpu);
        System {
            cfg,
            paths,
            tick,
            memory,
            scheduler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn tick(&self) -> &Arc<TickSource> {
        &self.tick
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Admits a process with a randomly generated program.
    pub fn create_random(&self, name: &str, mem_bytes: usize) -> Result<Arc<Process>, String> {
        let p = self.new_process(name, mem_bytes)?;
        p.load_program(gen::random_program(self.cfg.min_ins, self.cfg.max_ins, mem_bytes));
        self.scheduler.submit(Arc::clone(&p));
        Ok(p)
    }

    /// Admits a process with a program parsed from a `;`-separated script.
    /// Scripts of fewer than 1 or more than 50 instructions are rejected.
    pub fn create_scripted(
        &self,
        name: &str,
        mem_bytes: usize,
        src: &str,
    ) -> Result<Arc<Process>, String> {
        let (insts, warnings) = script::scan(src);
        if insts.is_empty() || insts.len() > 50 {
            return Err("script must contain between 1 and 50 instructions".to_string());
        }
        let p = self.new_process(name, mem_bytes)?;
        for w in warnings {
            p.push_log(format!("[Warning] {}", w));
        }
        p.load_program(insts);
        self.scheduler.submit(Arc::clone(&p));
        Ok(p)
    }

    fn new_process(&self, name: &str, mem_bytes: usize) -> Result<Arc<Process>, String> {
        if !is_valid_proc_mem_size(mem_bytes) {
            return Err(format!(
                "invalid memory size {}: must be a power of 2 between 64 and 65536",
                mem_bytes
            ));
        }
        let p = Process::new(
            self.scheduler.next_pid(),
            name.to_string(),
            Arc::clone(&self.memory),
            Arc::clone(&self.tick),
        );
        self.memory.allocate(&p, mem_bytes);
        Ok(p)
    }

    /// Read-only view of a named process, or the violation report when it
    /// was shut down for a bad access.
    pub fn attach(&self, name: &str) -> Option<String> {
        let p = self.scheduler.find_by_name(name)?;
        match p.status() {
            ProcStatus::Violation { address, time } => Some(format!(
                "Process '{}' shut down due to memory access violation error that occurred at {}. {} invalid.",
                name,
                time.format("%H:%M:%S"),
                address
            )),
            _ => Some(p.smi()),
        }
    }

    pub fn start_batch(&self) {
        self.scheduler.start_generation();
    }

    pub fn stop_batch(&self) {
        self.scheduler.stop_generation();
    }

    /// Stops the batch generator, drains the active population, then stops
    /// dispatch, the cores and the tick driver.
    pub fn shutdown(&self) {
        self.scheduler.stop_generation();
        self.scheduler.wait_until_done();
        self.scheduler.stop();
        self.tick.stop();
    }

    /// The `screen -ls` layout: utilization header, then running, sleeping
    /// and finished processes.
    pub fn screen_ls(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "CPU utilization:  {:.2}%\n",
            self.scheduler.cpu_utilization()
        ));
        out.push_str(&format!("Cores used:       {}\n", self.scheduler.cores_used()));
        out.push_str(&format!(
            "Cores available:  {}\n\n",
            self.scheduler.cores_available()
        ));
        out.push_str("----------------------------\n");

        out.push_str("Running processes:\n");
        let now = Local::now().format("%m/%d/%Y %I:%M:%S%p").to_string();
        let running = self.scheduler.running_processes();
        if running.is_empty() {
            out.push_str("  No processes currently running.\n");
        } else {
            for p in running {
                out.push_str(&format!(
                    "{:<15} ({}) Core:{} {} / {}\n",
                    p.name(),
                    now,
                    p.last_core_id().map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                    p.pc(),
                    p.program_len()
                ));
            }
        }

        out.push_str("\nSleeping processes:\n");
        let sleeping = self.scheduler.sleeping_processes();
        if sleeping.is_empty() {
            out.push_str("  No processes currently sleeping.\n");
        } else {
            for p in sleeping {
                let until = match p.status() {
                    ProcStatus::Sleeping { wake_tick } => wake_tick.to_string(),
                    _ => "-".into(),
                };
                out.push_str(&format!(
                    "{:<15} sleeping until tick {} ({} / {})\n",
                    p.name(),
                    until,
                    p.pc(),
                    p.program_len()
                ));
            }
        }

        out.push_str("\nFinished processes:\n");
        let finished = self.scheduler.finished_processes();
        if finished.is_empty() {
            out.push_str("  No processes have finished.\n");
        } else {
            for p in finished {
                let stamp = p
                    .finish_time()
                    .map(|t| t.format("%m/%d/%Y %I:%M:%S%p").to_string())
                    .unwrap_or_else(|| "-".into());
                let label = match p.status() {
                    ProcStatus::Violation { .. } => "Terminated",
                    _ => "Finished",
                };
                out.push_str(&format!(
                    "{:<15} ({}) {} {} / {}\n",
                    p.name(),
                    stamp,
                    label,
                    p.pc(),
                    p.program_len()
                ));
            }
        }
        out.push_str("----------------------------\n");
        out
    }

    /// High-level CPU and memory utilization summary.
    pub fn process_smi_summary(&self) -> String {
        let total = self.memory.total_bytes();
        let used = self.memory.used_frames() * self.memory.frame_size();
        let mem_util = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let mut out = String::new();
        out.push_str("+--------------------------------------------------+\n");
        out.push_str(&format!(
            "| CPU-Util: {:.2}%\n",
            self.scheduler.cpu_utilization()
        ));
        out.push_str(&format!("| Memory Usage: {}B / {}B\n", used, total));
        out.push_str(&format!("| Memory Util: {:.2}%\n", mem_util));
        out.push_str("+--------------------------------------------------+\n");
        out.push_str("Running processes and memory usage:\n");
        let running = self.scheduler.running_processes();
        if running.is_empty() {
            out.push_str("  No processes currently running.\n");
        } else {
            for p in running {
                out.push_str(&format!("  {:<15} {}B\n", p.name(), p.allocated_bytes()));
            }
        }
        out
    }

    /// Detailed virtual-memory statistics.
    pub fn vmstat(&self) -> String {
        let total = self.memory.total_bytes();
        let used = self.memory.used_frames() * self.memory.frame_size();
        let total_ticks = self.tick.now();
        let active_ticks = self.scheduler.active_cpu_ticks();
        let mut out = String::new();
        out.push_str(&format!("Total Memory (bytes) : {}\n", total));
        out.push_str(&format!("Used Memory (bytes)  : {}\n", used));
        out.push_str(&format!("Free Memory (bytes)  : {}\n", total - used));
        out.push_str(&format!("Frame Size (bytes)   : {}\n", self.memory.frame_size()));
        out.push_str(&format!(
            "CPU Idle Ticks       : {}\n",
            total_ticks.saturating_sub(active_ticks)
        ));
        out.push_str(&format!("CPU Active Ticks     : {}\n", active_ticks));
        out.push_str(&format!("CPU Total Ticks      : {}\n", total_ticks));
        out.push_str(&format!("Pages Paged In       : {}\n", self.memory.paged_in()));
        out.push_str(&format!("Pages Paged Out      : {}\n", self.memory.paged_out()));
        out
    }

    /// Writes the `screen -ls` layout to the report file.
    pub fn write_report(&self) -> Result<PathBuf, String> {
        let body = format!(
            "Report - {}\n\n{}",
            Local::now().format("%m/%d/%Y, %I:%M:%S %p"),
            self.screen_ls()
        );
        fs::write(&self.paths.report, body)
            .map_err(|e| format!("cannot write {}: {}", self.paths.report.display(), e))?;
        Ok(self.paths.report.clone())
    }
}
