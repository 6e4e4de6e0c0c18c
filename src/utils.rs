use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{Result, SimError};
use crate::mesi::{Addr, Instr, Insts, Value};

/// Decodes one trace line: `RD <addr>` or `WR <addr> <value>`.
/// Blank lines and `#` comments yield `Ok(None)`.
pub fn parse_instruction(line_no: usize, line: &str) -> Result<Option<Instr>> {
    let text = line.trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }
    let malformed = |reason| SimError::MalformedInstruction {
        line: line_no,
        text: text.to_string(),
        reason,
    };
    let mut parts = text.split_whitespace();
    let op = parts.next().unwrap_or_default().to_ascii_uppercase();

    let instr = match op.as_str() {
        "RD" => {
            let addr = parts.next().ok_or_else(|| malformed("missing address"))?;
            Instr::Read(Addr(addr.parse().map_err(|_| malformed("bad address"))?))
        }
        "WR" => {
            let addr = parts.next().ok_or_else(|| malformed("missing address"))?;
            let addr = Addr(addr.parse().map_err(|_| malformed("bad address"))?);
            let value = parts.next().ok_or_else(|| malformed("missing value"))?;
            Instr::Write(addr, value.parse::<Value>().map_err(|_| malformed("bad value"))?)
        }
        _ => return Err(malformed("unknown opcode")),
    };
    if parts.next().is_some() {
        return Err(malformed("trailing operands"));
    }
    Ok(Some(instr))
}

pub fn parse_program(src: &str) -> Result<Insts> {
    let mut insts = Vec::new();
    for (i, line) in src.lines().enumerate() {
        if let Some(instr) = parse_instruction(i + 1, line)? {
            insts.push(instr);
        }
    }
    Ok(insts)
}

pub fn read_trace_file(path: &Path) -> Result<Insts> {
    let src = fs::read_to_string(path).map_err(|source| SimError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_program(&src)
}

pub fn trace_path(dir: &Path, prefix: &str, core: usize) -> PathBuf {
    dir.join(format!("{prefix}{core}.txt"))
}

/// Reads `<dir>/<prefix><i>.txt` for every core `i`.
pub fn read_core_traces(dir: &Path, prefix: &str, num_cores: usize) -> Result<Vec<Insts>> {
    (0..num_cores)
        .map(|core| {
            let path = trace_path(dir, prefix, core);
            info!("reading file: {}", path.display());
            read_trace_file(&path)
        })
        .collect()
}
