use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Dispatch discipline for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Fcfs,
    RoundRobin,
}

impl SchedulerKind {
    fn parse(s: &str) -> Option<SchedulerKind> {
        match s {
            "fcfs" => Some(SchedulerKind::Fcfs),
            "rr" => Some(SchedulerKind::RoundRobin),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct ConfigError {
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "config error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Emulator parameters, loaded once before anything else runs.
///
/// File format is one `key value` pair per line, e.g.
/// ```text
/// num-cpu 4
/// scheduler "rr"
/// quantum-cycles 5
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub num_cpu: u32,
    pub scheduler: SchedulerKind,
    pub quantum_cycles: u64,
    pub batch_process_freq: u64,
    pub min_ins: u64,
    pub max_ins: u64,
    pub delay_per_exec: u64,
    pub max_overall_mem: usize,
    pub mem_per_frame: usize,
    pub min_mem_per_proc: usize,
    pub max_mem_per_proc: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_cpu: 1,
            scheduler: SchedulerKind::Fcfs,
            quantum_cycles: 1,
            batch_process_freq: 1,
            min_ins: 1,
            max_ins: 1,
            delay_per_exec: 0,
            max_overall_mem: 16384,
            mem_per_frame: 16,
            min_mem_per_proc: 1024,
            max_mem_per_proc: 4096,
        }
    }
}

pub fn is_power_of_two(n: usize) -> bool {
    n > 0 && (n & (n - 1)) == 0
}

/// Memory sizes a process may request at the shell boundary.
pub fn is_valid_proc_mem_size(n: usize) -> bool {
    is_power_of_two(n) && (64..=65536).contains(&n)
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let src = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Config::parse(&src)
    }

    pub fn parse(src: &str) -> Result<Config, ConfigError> {
        let mut kv = HashMap::new();
        for line in src.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(char::is_whitespace) {
                Some((k, v)) => {
                    kv.insert(k.to_string(), strip_quotes(v.trim()).to_string());
                }
                None => {
                    return Err(ConfigError {
                        message: format!("malformed line: {}", line),
                    })
                }
            }
        }

        let mut cfg = Config::default();
        cfg.num_cpu = get_num(&kv, "num-cpu")?;
        let sched = get(&kv, "scheduler")?;
        cfg.scheduler = SchedulerKind::parse(&sched).ok_or_else(|| ConfigError {
            message: format!("scheduler must be \"fcfs\" or \"rr\", got {}", sched),
        })?;
        cfg.quantum_cycles = get_num(&kv, "quantum-cycles")?;
        cfg.batch_process_freq = get_num(&kv, "batch-process-freq")?;
        cfg.min_ins = get_num(&kv, "min-ins")?;
        cfg.max_ins = get_num(&kv, "max-ins")?;
        cfg.delay_per_exec = get_num(&kv, "delay-per-exec")?;
        cfg.max_overall_mem = get_num(&kv, "max-overall-mem")?;
        cfg.mem_per_frame = get_num(&kv, "mem-per-frame")?;
        cfg.min_mem_per_proc = get_num(&kv, "min-mem-per-proc")?;
        cfg.max_mem_per_proc = get_num(&kv, "max-mem-per-proc")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let err = |m: String| Err(ConfigError { message: m });
        if self.num_cpu < 1 || self.num_cpu > 128 {
            return err(format!("num-cpu must be in [1, 128], got {}", self.num_cpu));
        }
        if self.quantum_cycles < 1 {
            return err("quantum-cycles must be at least 1".into());
        }
        if self.batch_process_freq < 1 {
            return err("batch-process-freq must be at least 1".into());
        }
        if self.min_ins < 1 {
            return err("min-ins must be at least 1".into());
        }
        if self.max_ins < self.min_ins {
            return err(format!(
                "min-ins {} exceeds max-ins {}",
                self.min_ins, self.max_ins
            ));
        }
        for (name, v) in [
            ("max-overall-mem", self.max_overall_mem),
            ("mem-per-frame", self.mem_per_frame),
            ("min-mem-per-proc", self.min_mem_per_proc),
            ("max-mem-per-proc", self.max_mem_per_proc),
        ] {
            if !is_power_of_two(v) {
                return err(format!("{} must be a power of two, got {}", name, v));
            }
        }
        if self.mem_per_frame > self.max_overall_mem {
            return err("mem-per-frame exceeds max-overall-mem".into());
        }
        if self.min_mem_per_proc > self.max_mem_per_proc {
            return err(format!(
                "min-mem-per-proc {} exceeds max-mem-per-proc {}",
                self.min_mem_per_proc, self.max_mem_per_proc
            ));
        }
        Ok(())
    }

    /// Number of physical frames the frame pool will hold.
    pub fn total_frames(&self) -> usize {
        self.max_overall_mem / self.mem_per_frame
    }
}

fn get(kv: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    kv.get(key).cloned().ok_or_else(|| ConfigError {
        message: format!("missing option: {}", key),
    })
}

fn get_num<T: std::str::FromStr>(kv: &HashMap<String, String>, key: &str) -> Result<T, ConfigError> {
    let raw = get(kv, key)?;
    raw.parse().map_err(|_| ConfigError {
        message: format!("option {} has invalid value: {}", key, raw),
    })
}

fn strip_quotes(s: &str) -> &str {
    let s = s
        .strip_prefix('"')
        .or_else(|| s.strip_prefix('\''))
        .unwrap_or(s);
    s.strip_suffix('"')
        .or_else(|| s.strip_suffix('\''))
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "num-cpu 4\n\
                        scheduler \"rr\"\n\
                        quantum-cycles 5\n\
                        batch-process-freq 1\n\
                        min-ins 1000\n\
                        max-ins 2000\n\
                        delay-per-exec 0\n\
                        max-overall-mem 16384\n\
                        mem-per-frame 16\n\
                        min-mem-per-proc 1024\n\
                        max-mem-per-proc 4096\n";

    #[test]
    fn parse_full_file() {
        let cfg = Config::parse(GOOD).unwrap();
        assert_eq!(4, cfg.num_cpu);
        assert_eq!(SchedulerKind::RoundRobin, cfg.scheduler);
        assert_eq!(5, cfg.quantum_cycles);
        assert_eq!(1000, cfg.min_ins);
        assert_eq!(2000, cfg.max_ins);
        assert_eq!(1024, cfg.total_frames());
    }

    #[test]
    fn missing_key_rejected() {
        let src = GOOD.replace("num-cpu 4\n", "");
        let e = Config::parse(&src).unwrap_err();
        assert!(e.message.contains("num-cpu"));
    }

    #[test]
    fn non_power_of_two_rejected() {
        let src = GOOD.replace("mem-per-frame 16", "mem-per-frame 24");
        assert!(Config::parse(&src).is_err());
    }

    #[test]
    fn bad_scheduler_rejected() {
        let src = GOOD.replace("\"rr\"", "\"sjf\"");
        assert!(Config::parse(&src).is_err());
    }

    #[test]
    fn ins_range_checked() {
        let src = GOOD.replace("min-ins 1000", "min-ins 3000");
        assert!(Config::parse(&src).is_err());
    }

    #[test]
    fn proc_mem_size_gate() {
        assert!(is_valid_proc_mem_size(64));
        assert!(is_valid_proc_mem_size(65536));
        assert!(!is_valid_proc_mem_size(32));
        assert!(!is_valid_proc_mem_size(100));
        assert!(!is_valid_proc_mem_size(131072));
    }
}
