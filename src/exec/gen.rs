use rand::rngs::ThreadRng;
use rand::Rng;

use super::inst::Inst;
use crate::mem::manager::SYMBOL_SEGMENT_BYTES;

const VAR_POOL: [&str; 6] = ["x", "y", "z", "a", "b", "c"];
const FOR_PROBABILITY: f64 = 0.15;
const MAX_GEN_DEPTH: usize = 3;
const MAX_BODY_LEN: usize = 5;

struct GenCtx {
    vars: Vec<&'static str>,
    allocated_bytes: usize,
    /// READ/WRITE are only generated when the process has a general segment
    /// past the symbol table to aim them at.
    mem_ops: bool,
}

/// Generates a random program of `min_ins..=max_ins` instructions for a
/// process with the given address-space size. Loops are bounded (body of at
/// most five instructions, nesting capped at three) and every generated
/// READ/WRITE lands 2-byte-aligned inside the general segment.
pub fn random_program(min_ins: u64, max_ins: u64, allocated_bytes: usize) -> Vec<Inst> {
    let mut rng = rand::thread_rng();
    let total = rng.gen_range(min_ins..=max_ins.max(min_ins)) as usize;

    // shrink the variable pool when the space cannot back all of it
    let capacity = (allocated_bytes / 2).min(VAR_POOL.len());
    let ctx = GenCtx {
        vars: VAR_POOL[..capacity.max(1)].to_vec(),
        allocated_bytes,
        mem_ops: allocated_bytes > SYMBOL_SEGMENT_BYTES,
    };

    let mut out = Vec::with_capacity(total);
    emit_block(&mut rng, &mut out, total, 0, &ctx);
    out
}

/// Random power-of-two memory size between `min` and `max` inclusive.
pub fn random_mem_size(min: usize, max: usize) -> usize {
    let mut sizes = Vec::new();
    let mut s = min;
    while s <= max {
        sizes.push(s);
        s *= 2;
    }
    if sizes.is_empty() {
        return min;
    }
    let mut rng = rand::thread_rng();
    sizes[rng.gen_range(0..sizes.len())]
}

fn emit_block(rng: &mut ThreadRng, out: &mut Vec<Inst>, quota: usize, depth: usize, ctx: &GenCtx) {
    let mut remaining = quota;
    while remaining > 0 {
        // a loop needs room for FOR + END + at least one body instruction
        if depth < MAX_GEN_DEPTH && remaining >= 3 && rng.gen_bool(FOR_PROBABILITY) {
            let body = rng.gen_range(1..=MAX_BODY_LEN.min(remaining - 2));
            out.push(Inst::For {
                repeats: rng.gen_range(1..=5).to_string(),
            });
            emit_block(rng, out, body, depth + 1, ctx);
            out.push(Inst::End);
            remaining -= body + 2;
        } else {
            out.push(flat_inst(rng, ctx));
            remaining -= 1;
        }
    }
}

fn flat_inst(rng: &mut ThreadRng, ctx: &GenCtx) -> Inst {
    let pool_len = if ctx.mem_ops { 7 } else { 5 };
    match rng.gen_range(0..pool_len) {
        0 => {
            let var = pick_var(rng, ctx);
            let value = if rng.gen_bool(0.5) {
                Some(rng.gen_range(0..=1000).to_string())
            } else {
                None
            };
            Inst::Declare { var, value }
        }
        1 => Inst::Add {
            dest: pick_var(rng, ctx),
            lhs: pick_var(rng, ctx),
            rhs: rng.gen_range(0..=100).to_string(),
        },
        2 => Inst::Sub {
            dest: pick_var(rng, ctx),
            lhs: pick_var(rng, ctx),
            rhs: rng.gen_range(0..=100).to_string(),
        },
        3 => Inst::Print { expr: None },
        4 => Inst::Sleep {
            ticks: rng.gen_range(1..=10).to_string(),
        },
        5 => Inst::Read {
            var: pick_var(rng, ctx),
            addr: pick_addr(rng, ctx),
        },
        _ => Inst::Write {
            addr: pick_addr(rng, ctx),
            value: rng.gen_range(0..=1000).to_string(),
        },
    }
}

fn pick_var(rng: &mut ThreadRng, ctx: &GenCtx) -> String {
    ctx.vars[rng.gen_range(0..ctx.vars.len())].to_string()
}

/// 2-byte-aligned address inside the general segment `[64, allocated)`.
fn pick_addr(rng: &mut ThreadRng, ctx: &GenCtx) -> String {
    let first_slot = SYMBOL_SEGMENT_BYTES / 2;
    let slots = ctx.allocated_bytes / 2;
    let slot = rng.gen_range(first_slot..slots);
    format!("0x{:X}", slot * 2)
}
