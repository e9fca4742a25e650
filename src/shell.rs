use std::io::{self, BufRead, Write};

use crate::system::System;

/// Interactive console over the emulator's control surface. A thin adapter:
/// every command maps onto one `System` call.
pub struct Console {
    system: System,
}

impl Console {
    pub fn new(system: System) -> Console {
        Console { system }
    }

    /// Reads commands from stdin until `exit` or end of input, then drains
    /// and shuts the system down.
    pub fn run(&self) {
        print_header();
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            print!("root:\\> ");
            let _ = io::stdout().flush();
            let line = match lines.next() {
                Some(Ok(line)) => line,
                _ => break,
            };
            let line = line.trim();
            if line == "exit" {
                break;
            }
            self.handle(line);
        }
        println!("Waiting for all processes to finish before exiting...");
        self.system.shutdown();
        println!("All processes finished. Goodbye.");
    }

    fn handle(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        if line == "help" {
            print_help();
        } else if line == "clear" {
            // ANSI clear + home
            print!("\x1B[2J\x1B[H");
            let _ = io::stdout().flush();
            print_header();
        } else if let Some(rest) = line.strip_prefix("screen -s ") {
            self.screen_create(rest, None);
        } else if let Some(rest) = line.strip_prefix("screen -c ") {
            self.screen_create_scripted(rest);
        } else if let Some(rest) = line.strip_prefix("screen -r ") {
            match self.system.attach(rest.trim()) {
                Some(view) => println!("{}", view),
                None => println!("Process '{}' not found.", rest.trim()),
            }
        } else if line == "screen -ls" {
            print!("{}", self.system.screen_ls());
        } else if line == "scheduler-start" {
            self.system.start_batch();
            println!("Batch process generation started.");
        } else if line == "scheduler-stop" {
            self.system.stop_batch();
            println!("Batch process generation stopped.");
        } else if line == "process-smi" {
            print!("{}", self.system.process_smi_summary());
        } else if line == "vmstat" {
            print!("{}", self.system.vmstat());
        } else if line == "report-util" {
            match self.system.write_report() {
                Ok(path) => println!("Report written to {}", path.display()),
                Err(e) => println!("{}", e),
            }
        } else {
            println!("Unknown command: {}", line);
        }
    }

    fn screen_create(&self, rest: &str, script: Option<&str>) {
        let mut parts = rest.split_whitespace();
        let (name, size) = match (parts.next(), parts.next().and_then(|s| s.parse().ok())) {
            (Some(name), Some(size)) => (name, size),
            _ => {
                println!("Usage: screen -s <name> <memory_size>");
                return;
            }
        };
        let result = match script {
            Some(src) => self.system.create_scripted(name, size, src),
            None => self.system.create_random(name, size),
        };
        match result {
            Ok(_) => println!("Process '{}' created and submitted.", name),
            Err(e) => println!("{}", e),
        }
    }

    fn screen_create_scripted(&self, rest: &str) {
        // script is the quoted tail: screen -c <name> <size> "<instructions>"
        let script = match (rest.find('"'), rest.rfind('"')) {
            (Some(first), Some(last)) if last > first => &rest[first + 1..last],
            _ => {
                println!("Usage: screen -c <name> <size> \"<instructions>\"");
                return;
            }
        };
        let head = &rest[..rest.find('"').unwrap_or(rest.len())];
        self.screen_create(head, Some(script));
    }
}

fn print_header() {
    println!("osim - OS emulator");
    println!("Type 'help' to see available commands");
}

fn print_help() {
    println!("Available commands:");
    println!("- screen -s <name> <size>: create a process with a random program");
    println!("- screen -c <name> <size> \"<instr>\": create a process from a script");
    println!("- screen -r <name>: attach to a process view");
    println!("- screen -ls: list running, sleeping and finished processes");
    println!("- scheduler-start / scheduler-stop: toggle batch process generation");
    println!("- process-smi: CPU and memory utilization summary");
    println!("- vmstat: virtual memory statistics");
    println!("- report-util: write the process list to the report file");
    println!("- clear: clear the screen");
    println!("- exit: drain processes and quit");
}
