use std::path::Path;
use std::process::ExitCode;

use osim::config::Config;
use osim::shell::Console;
use osim::system::System;

fn main() -> ExitCode {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.txt".to_string());
    let cfg = match Config::load(Path::new(&path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let system = System::boot(cfg);
    Console::new(system).run();
    ExitCode::SUCCESS
}
