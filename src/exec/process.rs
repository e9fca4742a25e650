use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};

use super::inst::{clamp_u16, is_literal, parse_literal, Inst};
use crate::mem::manager::{MemoryManager, VarAllocError};
use crate::mem::MemResult;
use crate::tick::TickSource;

pub const MAX_LOOP_DEPTH: usize = 3;
pub const MAX_LOOP_REPEATS: u16 = 1000;

/// What one `step` call did. Only the first three retire an instruction and
/// therefore cost a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One instruction ran and the process can keep going.
    Advanced,
    /// A SLEEP ran and parked the process; hand it back to the scheduler.
    Suspended,
    /// The final instruction ran; the process is now terminal.
    Finished,
    /// Nothing executed: the process was already terminal, had no program
    /// left, or is still sleeping.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcStatus {
    Running,
    Sleeping { wake_tick: u64 },
    FinishedNormal,
    /// Memory access violation (or out-of-memory, with its marker address).
    Violation { address: String, time: DateTime<Local> },
}

impl ProcStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcStatus::FinishedNormal | ProcStatus::Violation { .. })
    }
}

#[derive(Debug, Clone)]
struct LoopFrame {
    start_pc: usize,
    remaining: u16,
}

/// Paging view of one process. Everything here is guarded by a single lock
/// because eviction running on another core flips the valid bits while the
/// owner executes.
pub struct PageState {
    pub allocated_bytes: usize,
    pub symbol_table: HashMap<String, String>,
    pub page_table: HashMap<usize, Option<usize>>,
    pub valid_bits: HashMap<usize, bool>,
}

struct ExecState {
    pc: usize,
    loop_stack: Vec<LoopFrame>,
    status: ProcStatus,
    /// Set while a SLEEP at the current pc has parked once; the re-executed
    /// SLEEP sees it and falls through instead of sleeping again.
    sleep_pending: bool,
    last_core_id: Option<usize>,
    finish_time: Option<DateTime<Local>>,
}

/// One emulated process: a fixed program, a private logical address space
/// viewed through `PageState`, and an interpreter that advances at most one
/// instruction per `step`.
pub struct Process {
    pid: u64,
    name: String,
    memory: Arc<MemoryManager>,
    tick: Arc<TickSource>,
    program: Mutex<Arc<Vec<Inst>>>,
    exec: Mutex<ExecState>,
    pages: Mutex<PageState>,
    logs: Mutex<Vec<(DateTime<Local>, String)>>,
    dispatch_count: AtomicU64,
}

impl Process {
    pub fn new(
        pid: u64,
        name: String,
        memory: Arc<MemoryManager>,
        tick: Arc<TickSource>,
    ) -> Arc<Process> {
        Arc::new(Process {
            pid,
            name,
            memory,
            tick,
            program: Mutex::new(Arc::new(Vec::new())),
            exec: Mutex::new(ExecState {
                pc: 0,
                loop_stack: Vec::new(),
                status: ProcStatus::Running,
                sleep_pending: false,
                last_core_id: None,
                finish_time: None,
            }),
            pages: Mutex::new(PageState {
                allocated_bytes: 0,
                symbol_table: HashMap::new(),
                page_table: HashMap::new(),
                valid_bits: HashMap::new(),
            }),
            logs: Mutex::new(Vec::new()),
            dispatch_count: AtomicU64::new(0),
        })
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load_program(&self, program: Vec<Inst>) {
        *self.program.lock().unwrap() = Arc::new(program);
    }

    pub fn program_len(&self) -> usize {
        self.program.lock().unwrap().len()
    }

    pub fn pc(&self) -> usize {
        self.exec.lock().unwrap().pc
    }

    pub fn status(&self) -> ProcStatus {
        self.exec.lock().unwrap().status.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_sleeping(&self) -> bool {
        matches!(self.status(), ProcStatus::Sleeping { .. })
    }

    /// Clears an expired sleep. Returns true when the process moved back to
    /// Running and belongs in the ready queue.
    pub fn try_wake(&self, now: u64) -> bool {
        let mut st = self.exec.lock().unwrap();
        match st.status {
            ProcStatus::Sleeping { wake_tick } if now >= wake_tick => {
                st.status = ProcStatus::Running;
                true
            }
            _ => false,
        }
    }

    pub fn note_dispatch(&self, core_id: usize) {
        self.exec.lock().unwrap().last_core_id = Some(core_id);
        self.dispatch_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::Acquire)
    }

    pub fn last_core_id(&self) -> Option<usize> {
        self.exec.lock().unwrap().last_core_id
    }

    pub fn mark_finish_time(&self, t: DateTime<Local>) {
        self.exec.lock().unwrap().finish_time = Some(t);
    }

    pub fn finish_time(&self) -> Option<DateTime<Local>> {
        self.exec.lock().unwrap().finish_time
    }

    pub(crate) fn page_state(&self) -> MutexGuard<'_, PageState> {
        self.pages.lock().unwrap()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.page_state().allocated_bytes
    }

    pub fn symbol_table(&self) -> HashMap<String, String> {
        self.page_state().symbol_table.clone()
    }

    /// Current value of a declared variable, if any.
    pub fn var_value(&self, name: &str) -> Option<u16> {
        let addr = self.page_state().symbol_table.get(name).cloned()?;
        self.memory.read(self, &addr).ok()
    }

    pub fn push_log(&self, message: String) {
        self.logs.lock().unwrap().push((Local::now(), message));
    }

    pub fn logs(&self) -> Vec<(DateTime<Local>, String)> {
        self.logs.lock().unwrap().clone()
    }

    /// Advances at most one instruction.
    ///
    /// A memory error terminates the process (recording the faulting
    /// address and time) and propagates so the core stops running it.
    pub fn step(&self, core_id: usize) -> MemResult<StepOutcome> {
        let mut st = self.exec.lock().unwrap();

        if st.status.is_terminal() {
            return Ok(StepOutcome::Idle);
        }
        if let ProcStatus::Sleeping { wake_tick } = st.status {
            if self.tick.now() < wake_tick {
                return Ok(StepOutcome::Idle);
            }
            st.status = ProcStatus::Running;
        }

        let program = self.program.lock().unwrap().clone();
        if st.pc >= program.len() {
            st.status = ProcStatus::FinishedNormal;
            return Ok(StepOutcome::Idle);
        }

        let pc_before = st.pc;
        let inst = program[pc_before].clone();
        if let Err(e) = self.execute(&mut st, &program, &inst, core_id) {
            st.status = ProcStatus::Violation {
                address: e.violation_address().to_string(),
                time: Local::now(),
            };
            drop(st);
            self.push_log(format!("[Error] {}", e));
            return Err(e);
        }

        let now_sleeping = matches!(st.status, ProcStatus::Sleeping { .. });
        if st.pc == pc_before && !now_sleeping {
            st.pc += 1;
        }
        if now_sleeping {
            return Ok(StepOutcome::Suspended);
        }
        if st.pc >= program.len() {
            st.status = ProcStatus::FinishedNormal;
            return Ok(StepOutcome::Finished);
        }
        Ok(StepOutcome::Advanced)
    }

    fn execute(
        &self,
        st: &mut ExecState,
        program: &[Inst],
        inst: &Inst,
        core_id: usize,
    ) -> MemResult<()> {
        match inst {
            Inst::Declare { var, value } => {
                let v = match value {
                    Some(token) => self.operand_value(token)?,
                    None => 0,
                };
                match self.memory.allocate_variable(self, var) {
                    Ok(addr) => self.memory.write(self, &addr, v)?,
                    Err(e) => self.note_alloc_failure("DECLARE", var, e)?,
                }
            }
            Inst::Add { dest, lhs, rhs } => {
                let a = self.operand_value(lhs)? as i64;
                let b = self.operand_value(rhs)? as i64;
                self.store_to_var("ADD", dest, clamp_u16(a + b))?;
            }
            Inst::Sub { dest, lhs, rhs } => {
                let a = self.operand_value(lhs)? as i64;
                let b = self.operand_value(rhs)? as i64;
                self.store_to_var("SUB", dest, clamp_u16(a - b))?;
            }
            Inst::Print { expr } => {
                let msg = match expr {
                    Some(e) => self.render_print(e)?,
                    None => format!("Hello world from {}!", self.name),
                };
                self.push_log(format!("Core:{} \"{}\"", core_id, msg));
            }
            Inst::Sleep { ticks } => {
                if st.sleep_pending {
                    // woken from this very SLEEP: fall through
                    st.sleep_pending = false;
                } else {
                    let t = self.operand_value(ticks)? as u64;
                    if t > 0 {
                        st.status = ProcStatus::Sleeping {
                            wake_tick: self.tick.now() + t,
                        };
                        st.sleep_pending = true;
                    }
                }
            }
            Inst::For { repeats } => {
                if st.loop_stack.len() >= MAX_LOOP_DEPTH {
                    self.push_log("[Warning] FOR nesting limit reached, skipping".to_string());
                } else {
                    let n = self.operand_value(repeats)?;
                    if n == 0 {
                        // zero-trip loop: jump past the matching END
                        st.pc = match matching_end(program, st.pc) {
                            Some(end) => end + 1,
                            None => {
                                self.push_log(
                                    "[Error] FOR without matching END".to_string(),
                                );
                                program.len()
                            }
                        };
                    } else {
                        st.loop_stack.push(LoopFrame {
                            start_pc: st.pc + 1,
                            remaining: n.min(MAX_LOOP_REPEATS),
                        });
                    }
                }
            }
            Inst::End => match st.loop_stack.last_mut() {
                Some(frame) => {
                    frame.remaining -= 1;
                    if frame.remaining > 0 {
                        st.pc = frame.start_pc;
                    } else {
                        st.loop_stack.pop();
                    }
                }
                None => {
                    self.push_log("[Error] END without matching FOR".to_string());
                }
            },
            Inst::Read { var, addr } => {
                // ensure the destination exists the way DECLARE would; if
                // that fails the whole instruction degrades to a no-op
                match self.memory.allocate_variable(self, var) {
                    Ok(vaddr) => {
                        let value = self.memory.read(self, addr)?;
                        self.memory.write(self, &vaddr, value)?;
                    }
                    Err(e) => self.note_alloc_failure("READ", var, e)?,
                }
            }
            Inst::Write { addr, value } => {
                let v = self.operand_value(value)?;
                self.memory.write(self, addr, v)?;
            }
        }
        Ok(())
    }

    /// Resolves an operand token: literals by value, identifiers through the
    /// symbol table and memory. Unknown identifiers read as 0.
    fn operand_value(&self, token: &str) -> MemResult<u16> {
        if is_literal(token) {
            return Ok(parse_literal(token));
        }
        let addr = self.page_state().symbol_table.get(token).cloned();
        match addr {
            Some(addr) => self.memory.read(self, &addr),
            None => Ok(0),
        }
    }

    /// Writes an arithmetic result to `dest`, allocating it on first use.
    fn store_to_var(&self, mnemonic: &str, dest: &str, value: u16) -> MemResult<()> {
        match self.memory.allocate_variable(self, dest) {
            Ok(addr) => self.memory.write(self, &addr, value),
            Err(e) => self.note_alloc_failure(mnemonic, dest, e),
        }
    }

    /// Allocation failures degrade the instruction to a logged no-op; real
    /// memory faults keep propagating.
    fn note_alloc_failure(&self, mnemonic: &str, var: &str, e: VarAllocError) -> MemResult<()> {
        match e {
            VarAllocError::Memory(e) => Err(e),
            VarAllocError::SymbolTableFull => {
                self.push_log(format!("[Warning] {} {}: symbol table full", mnemonic, var));
                Ok(())
            }
            VarAllocError::ProcessMemoryFull => {
                self.push_log(format!("[Warning] {} {}: process memory full", mnemonic, var));
                Ok(())
            }
        }
    }

    /// Renders a PRINT expression: a `+`-concatenation of double-quoted
    /// string literals (with backslash escapes) and operand tokens.
    fn render_print(&self, expr: &str) -> MemResult<String> {
        let mut out = String::new();
        let mut chars = expr.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                ' ' | '\t' | '\n' | '+' => continue,
                '"' => {
                    while let Some(c) = chars.next() {
                        match c {
                            '"' => break,
                            '\\' => match chars.next() {
                                Some('n') => out.push('\n'),
                                Some('t') => out.push('\t'),
                                Some(other) => out.push(other),
                                None => break,
                            },
                            other => out.push(other),
                        }
                    }
                }
                first => {
                    let mut token = String::new();
                    token.push(first);
                    while let Some(&c) = chars.peek() {
                        if c == '+' || c.is_whitespace() {
                            break;
                        }
                        token.push(c);
                        chars.next();
                    }
                    let value = self.operand_value(&token)?;
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(out)
    }

    /// Human-readable process summary for the attach view.
    pub fn smi(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Process name: {}\n", self.name));
        out.push_str(&format!("ID: {}\n", self.pid));
        out.push_str("Logs:\n");
        let logs = self.logs();
        if logs.is_empty() {
            out.push_str("  (No logs yet)\n");
        } else {
            for (t, msg) in logs {
                out.push_str(&format!("  ({}) {}\n", t.format("%m/%d/%Y %I:%M:%S%p"), msg));
            }
        }
        match self.status() {
            ProcStatus::FinishedNormal => out.push_str("Finished!\n"),
            ProcStatus::Sleeping { wake_tick } => {
                out.push_str(&format!("Status: Sleeping (until tick: {})\n", wake_tick))
            }
            ProcStatus::Violation { address, time } => out.push_str(&format!(
                "Status: Terminated at {} ({} invalid)\n",
                time.format("%H:%M:%S"),
                address
            )),
            ProcStatus::Running => out.push_str("Status: Running\n"),
        }
        out.push_str(&format!("Current instruction line: {}\n", self.pc()));
        out.push_str(&format!("Lines of code: {}\n", self.program_len()));
        out
    }
}

/// Index of the END matching the FOR at `for_pc`, if the program has one.
fn matching_end(program: &[Inst], for_pc: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, inst) in program.iter().enumerate().skip(for_pc) {
        match inst {
            Inst::For { .. } => depth += 1,
            Inst::End => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
