pub mod gen;
pub mod inst;
pub mod process;
pub mod script;

pub use inst::Inst;
pub use process::{ProcStatus, Process, StepOutcome};
