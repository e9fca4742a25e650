use regex::Regex;

use super::inst::Inst;

/// Scans a `;`-separated textual script into instructions.
///
/// Statements that do not scan (unknown opcode, wrong arity) are skipped and
/// reported as warnings — a malformed statement is never fatal, it only
/// costs the statement. `PRINT(<expr>)` keeps its expression verbatim.
pub fn scan(src: &str) -> (Vec<Inst>, Vec<String>) {
    // (?s) lets a PRINT expression span separators inside the parentheses
    let print_re = Regex::new(r"(?s)^PRINT\s*\((.*)\)$").unwrap();

    let mut insts = Vec::new();
    let mut warnings = Vec::new();
    for stmt in src.split(';') {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        if let Some(cap) = print_re.captures(stmt) {
            let expr = cap[1].trim().to_string();
            insts.push(Inst::Print {
                expr: if expr.is_empty() { None } else { Some(expr) },
            });
            continue;
        }
        let parts: Vec<&str> = stmt.split_whitespace().collect();
        match parts.as_slice() {
            ["DECLARE", var] => insts.push(Inst::Declare {
                var: var.to_string(),
                value: None,
            }),
            ["DECLARE", var, value] => insts.push(Inst::Declare {
                var: var.to_string(),
                value: Some(value.to_string()),
            }),
            ["ADD", dest, lhs, rhs] => insts.push(Inst::Add {
                dest: dest.to_string(),
                lhs: lhs.to_string(),
                rhs: rhs.to_string(),
            }),
            ["SUB", dest, lhs, rhs] => insts.push(Inst::Sub {
                dest: dest.to_string(),
                lhs: lhs.to_string(),
                rhs: rhs.to_string(),
            }),
            ["PRINT"] => insts.push(Inst::Print { expr: None }),
            ["SLEEP", ticks] => insts.push(Inst::Sleep {
                ticks: ticks.to_string(),
            }),
            ["FOR", repeats] => insts.push(Inst::For {
                repeats: repeats.to_string(),
            }),
            ["END"] => insts.push(Inst::End),
            ["READ", var, addr] => insts.push(Inst::Read {
                var: var.to_string(),
                addr: addr.to_string(),
            }),
            ["WRITE", addr, value] => insts.push(Inst::Write {
                addr: addr.to_string(),
                value: value.to_string(),
            }),
            _ => warnings.push(format!("skipped malformed statement: {}", stmt)),
        }
    }
    (insts, warnings)
}
