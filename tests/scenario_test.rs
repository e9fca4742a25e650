use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use osim::config::{Config, SchedulerKind};
use osim::exec::{ProcStatus, Process};
use osim::system::{System, SystemPaths};

fn temp_paths(tag: &str) -> SystemPaths {
    let dir = std::env::temp_dir();
    let stamp = format!("osim-scenario-{}-{}", std::process::id(), tag);
    let file = |suffix: &str| -> PathBuf {
        let mut p = dir.clone();
        p.push(format!("{}-{}", stamp, suffix));
        p
    };
    SystemPaths {
        backing_log: file("backing.txt"),
        snapshot: file("vmstat.txt"),
        report: file("report.txt"),
    }
}

/// The §8 scenario configuration: one core, RR with quantum 4, four frames
/// of 16 bytes.
fn scenario_config() -> Config {
    Config {
        num_cpu: 1,
        scheduler: SchedulerKind::RoundRobin,
        quantum_cycles: 4,
        batch_process_freq: 50,
        min_ins: 3,
        max_ins: 8,
        delay_per_exec: 0,
        max_overall_mem: 64,
        mem_per_frame: 16,
        min_mem_per_proc: 64,
        max_mem_per_proc: 256,
    }
}

fn boot(tag: &str, cfg: Config) -> System {
    cfg.validate().unwrap();
    System::boot_with_paths(cfg, temp_paths(tag))
}

fn wait_for_drain(system: &System, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while system.scheduler().active_count() > 0 {
        assert!(Instant::now() < deadline, "processes did not drain in time");
        thread::sleep(Duration::from_millis(10));
    }
}

fn has_log(p: &Process, needle: &str) -> bool {
    p.logs().iter().any(|(_, m)| m.contains(needle))
}

#[test]
fn arithmetic_program_runs_to_completion() {
    let system = boot("s1", scenario_config());
    let p = system
        .create_scripted(
            "s1",
            64,
            "DECLARE x 10; DECLARE y 20; ADD z x y; PRINT(\"z=\"+z)",
        )
        .unwrap();
    wait_for_drain(&system, Duration::from_secs(10));

    assert_eq!(ProcStatus::FinishedNormal, p.status());
    assert!(has_log(&p, "z=30"), "logs: {:?}", p.logs());
    let symbols = p.symbol_table();
    assert_eq!(Some(&"0x0".to_string()), symbols.get("x"));
    assert_eq!(Some(&"0x2".to_string()), symbols.get("y"));
    assert_eq!(Some(&"0x4".to_string()), symbols.get("z"));
    system.shutdown();
}

#[test]
fn addition_saturates_at_u16_max() {
    let system = boot("s2", scenario_config());
    let p = system
        .create_scripted("s2", 64, "DECLARE x 65530; ADD x x 100; PRINT(\"x=\"+x)")
        .unwrap();
    wait_for_drain(&system, Duration::from_secs(10));
    assert!(has_log(&p, "x=65535"), "logs: {:?}", p.logs());
    system.shutdown();
}

#[test]
fn bounded_loop_counts_to_three() {
    let system = boot("s3", scenario_config());
    let p = system
        .create_scripted("s3", 64, "DECLARE c 0; FOR 3; ADD c c 1; END; PRINT(\"c=\"+c)")
        .unwrap();
    wait_for_drain(&system, Duration::from_secs(10));
    assert_eq!(ProcStatus::FinishedNormal, p.status());
    assert!(has_log(&p, "c=3"), "logs: {:?}", p.logs());
    system.shutdown();
}

#[test]
fn out_of_bounds_write_terminates_the_process() {
    let system = boot("s4", scenario_config());
    let p = system.create_scripted("s4", 64, "WRITE 0x80 5").unwrap();
    wait_for_drain(&system, Duration::from_secs(10));

    match p.status() {
        ProcStatus::Violation { address, .. } => assert_eq!("0x80", address),
        other => panic!("expected violation, got {:?}", other),
    }
    assert_eq!(0, system.memory().paged_in());
    // the violated process lands in the finished list
    assert_eq!(1, system.scheduler().finished_processes().len());
    let view = system.attach("s4").unwrap();
    assert!(view.contains("0x80 invalid"), "{}", view);
    system.shutdown();
}

#[test]
fn paging_pressure_evicts_and_preserves_contents() {
    // F = 4. p1 and p2 fill all four frames with two pages each, then park;
    // p3 forces two evictions in admission order (p1's pages); waking p1
    // refaults them byte-identical.
    let system = boot("s5", scenario_config());
    let p1 = system
        .create_scripted(
            "p1",
            64,
            "WRITE 0x2 11; WRITE 0x12 12; SLEEP 5000; READ v 0x2; PRINT(\"v=\"+v)",
        )
        .unwrap();
    let p2 = system
        .create_scripted("p2", 64, "WRITE 0x2 21; WRITE 0x12 22; SLEEP 5000")
        .unwrap();
    // give p1 and p2 their page-ins before admitting the pressure source
    let deadline = Instant::now() + Duration::from_secs(5);
    while system.memory().paged_in() < 4 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(4, system.memory().paged_in());

    let p3 = system
        .create_scripted("p3", 64, "WRITE 0x2 31; WRITE 0x12 32")
        .unwrap();
    wait_for_drain(&system, Duration::from_secs(20));

    assert_eq!(ProcStatus::FinishedNormal, p3.status());
    assert!(system.memory().paged_out() >= 2);
    assert!(system.memory().paged_in() >= 6);
    // eviction round-trip: p1 reads back exactly what it wrote
    assert!(has_log(&p1, "v=11"), "logs: {:?}", p1.logs());
    assert_eq!(ProcStatus::FinishedNormal, p2.status());
    system.shutdown();
}

#[test]
fn quantum_alternates_two_processes() {
    let mut cfg = scenario_config();
    cfg.quantum_cycles = 2;
    let system = boot("s6", cfg);
    let tick0 = system.tick().now();

    let src = "DECLARE a 1; DECLARE b 2; ADD c a b; SUB d b a; PRINT";
    let p1 = system.create_scripted("q1", 64, src).unwrap();
    let p2 = system.create_scripted("q2", 64, src).unwrap();
    wait_for_drain(&system, Duration::from_secs(10));

    assert_eq!(5, p1.pc());
    assert_eq!(5, p2.pc());
    assert_eq!(ProcStatus::FinishedNormal, p1.status());
    assert_eq!(ProcStatus::FinishedNormal, p2.status());
    // 5 instructions under quantum 2 means at least 3 assignments each, so
    // the single core alternated between them repeatedly
    assert!(p1.dispatch_count() >= 2, "p1 dispatched {}", p1.dispatch_count());
    assert!(p2.dispatch_count() >= 2, "p2 dispatched {}", p2.dispatch_count());
    assert!(system.tick().now() - tick0 >= 10);
    system.shutdown();
}

#[test]
fn fcfs_runs_each_process_on_one_assignment() {
    let mut cfg = scenario_config();
    cfg.num_cpu = 2;
    cfg.scheduler = SchedulerKind::Fcfs;
    cfg.max_overall_mem = 256;
    let system = boot("fcfs", cfg);

    let src = "DECLARE a 1; ADD a a 1; ADD a a 1; PRINT(\"a=\"+a)";
    let mut procs = Vec::new();
    for i in 0..4 {
        procs.push(system.create_scripted(&format!("f{}", i), 64, src).unwrap());
    }
    wait_for_drain(&system, Duration::from_secs(10));

    for p in &procs {
        assert_eq!(ProcStatus::FinishedNormal, p.status());
        assert!(has_log(p, "a=3"), "logs: {:?}", p.logs());
        // FCFS holds the core until completion: exactly one assignment
        assert_eq!(1, p.dispatch_count());
    }
    assert_eq!(4, system.scheduler().finished_processes().len());
    system.shutdown();
}

#[test]
fn sleep_wakes_on_schedule() {
    let system = boot("sleep", scenario_config());
    let p = system
        .create_scripted("zz", 64, "DECLARE x 1; SLEEP 100; ADD x x 1; PRINT(\"x=\"+x)")
        .unwrap();
    wait_for_drain(&system, Duration::from_secs(10));
    assert_eq!(ProcStatus::FinishedNormal, p.status());
    assert!(has_log(&p, "x=2"), "logs: {:?}", p.logs());
    system.shutdown();
}

#[test]
fn batch_generation_mints_processes() {
    let mut cfg = scenario_config();
    cfg.max_overall_mem = 4096;
    cfg.mem_per_frame = 16;
    cfg.batch_process_freq = 20;
    let system = boot("batch", cfg);

    system.start_batch();
    let deadline = Instant::now() + Duration::from_secs(10);
    while system.scheduler().submitted_count() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    system.stop_batch();
    let submitted = system.scheduler().submitted_count();
    assert!(submitted >= 3, "only {} processes generated", submitted);

    wait_for_drain(&system, Duration::from_secs(30));
    // every accepted submit is accounted for: drained actives + finished
    assert_eq!(
        submitted,
        system.scheduler().finished_processes().len() as u64
    );
    // generated processes follow the p<pid> naming scheme
    assert!(system
        .scheduler()
        .finished_processes()
        .iter()
        .all(|p| p.name().starts_with('p')));
    system.shutdown();
}

#[test]
fn scripted_length_gate() {
    let system = boot("gate", scenario_config());
    assert!(system.create_scripted("empty", 64, " ; ; ").is_err());
    let mut long = String::new();
    for _ in 0..51 {
        long.push_str("PRINT;");
    }
    assert!(system.create_scripted("long", 64, &long).is_err());
    assert!(system.create_random("badmem", 100).is_err());
    system.shutdown();
}

#[test]
fn listing_shows_finished_processes() {
    let system = boot("ls", scenario_config());
    let _p = system.create_scripted("lister", 64, "DECLARE x 1").unwrap();
    wait_for_drain(&system, Duration::from_secs(10));
    let ls = system.screen_ls();
    assert!(ls.contains("lister"), "{}", ls);
    assert!(ls.contains("Finished"), "{}", ls);
    let smi = system.attach("lister").unwrap();
    assert!(smi.contains("Process name: lister"), "{}", smi);
    assert!(smi.contains("Finished!"), "{}", smi);
    system.shutdown();
}
