// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use std::collections::BTreeMap;

use crate::marshal::Value;
use crate::opcode::OpcodeTable;

/// An instruction's argument is either a resolved integer or a symbolic
/// label name. Labels are resolved to numeric offsets only at
/// serialization time (`crate::patch::Patcher::fix_all`); every jump
/// target during editing is symbolic so arbitrary offset shifts never
/// invalidate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Imm(u32),
    Label(String),
}

impl Argument {
    pub fn as_imm(&self) -> Option<u32> {
        match self {
            Argument::Imm(n) => Some(*n),
            Argument::Label(_) => None,
        }
    }

    pub fn as_label(&self) -> Option<&str> {
        match self {
            Argument::Imm(_) => None,
            Argument::Label(l) => Some(l.as_str()),
        }
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Argument::Label(_))
    }
}

/// A mutable instruction record. `line_no` is transient: it only exists
/// to drive human-readable emission and the line-number map
/// reconstruction in `Patcher::fix_line_no`; it is not itself the
/// source of truth (the code object's `line_table` is).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub opname: String,
    pub argument: Argument,
    pub offset: usize,
    pub line_no: Option<u32>,
}

impl Instruction {
    pub fn new(opc: &OpcodeTable, opname: &str, argument: Argument) -> Instruction {
        let opcode = opc.opcode(opname).unwrap_or_else(|| {
            panic!("opcode table for {:?} has no entry for {opname}", opc.version())
        });
        Instruction { opcode, opname: opname.to_string(), argument, offset: 0, line_no: None }
    }
}

/// Ancillary fields carried through a rewrite unchanged: argument
/// counts, flags, and the names that identify the code object (used by
/// the walker to relink nested code objects by name after rewriting).
#[derive(Debug, Clone)]
pub struct CodeMetadata {
    pub name: String,
    pub filename: String,
    pub argcount: u32,
    pub kwonlyargcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: u32,
}

/// The mutable working form of a code object, per §3. Constants, names,
/// and metadata pass through a rewrite largely unchanged; the
/// instruction stream and line table are what the patcher mutates.
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
    pub names: Vec<String>,
    pub first_line_no: u32,
    /// Offset -> line number, decoded from the compact on-disk form on
    /// entry (`decode_lnotab`) and re-encoded on exit (`encode_lnotab`).
    pub line_table: BTreeMap<usize, u32>,
    pub metadata: CodeMetadata,
}

impl CodeObject {
    pub fn find_inst_index(&self, offset: usize) -> Option<usize> {
        self.instructions.iter().position(|i| i.offset == offset)
    }
}

/// Decodes CPython's compact `co_lnotab` format (pairs of unsigned byte
/// offset deltas and signed byte line deltas, each pair chained with
/// zero-line-delta continuations when a single address delta would
/// overflow a byte) into an offset -> line-number map. Follows
/// CPython's `findlinestarts`: an entry is only emitted once an address
/// advance is about to happen and the line differs from the last one
/// emitted, so a `(255, 0)` continuation pair never produces a spurious
/// entry at an offset that isn't actually an instruction boundary.
pub fn decode_lnotab(lnotab: &[u8], first_line_no: u32) -> BTreeMap<usize, u32> {
    let mut map = BTreeMap::new();
    let mut addr: usize = 0;
    let mut line: i64 = first_line_no as i64;
    let mut last_emitted: Option<i64> = None;
    let mut i = 0;
    while i + 1 < lnotab.len() {
        let addr_incr = lnotab[i] as usize;
        let line_incr_raw = lnotab[i + 1];
        if addr_incr > 0 {
            if last_emitted != Some(line) {
                map.insert(addr, line as u32);
                last_emitted = Some(line);
            }
            addr += addr_incr;
        }
        let line_incr = if line_incr_raw >= 0x80 { line_incr_raw as i64 - 256 } else { line_incr_raw as i64 };
        line += line_incr;
        i += 2;
    }
    if last_emitted != Some(line) {
        map.insert(addr, line as u32);
    }
    map
}

/// Inverse of `decode_lnotab`. Produces a table that round-trips through
/// `decode_lnotab` back to an equivalent map (equivalent, not
/// necessarily byte-identical, since `decode_lnotab` drops entries with
/// in `line_incr == 0 && addr_incr == 0` and a minimal encoder never
/// produces one).
pub fn encode_lnotab(line_table: &BTreeMap<usize, u32>, first_line_no: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    let mut line = first_line_no as i64;
    for (&off, &ln) in line_table.iter() {
        if off == 0 && ln == first_line_no {
            continue;
        }
        let mut addr_delta = off - offset;
        let mut line_delta = ln as i64 - line;
        while addr_delta > 255 {
            out.push(255u8);
            out.push(0u8);
            addr_delta -= 255;
        }
        while line_delta > 127 {
            out.push(addr_delta as u8);
            out.push(127u8);
            addr_delta = 0;
            line_delta -= 127;
        }
        while line_delta < -128 {
            out.push(addr_delta as u8);
            out.push((-128i64 & 0xFF) as u8);
            addr_delta = 0;
            line_delta += 128;
        }
        out.push(addr_delta as u8);
        out.push((line_delta & 0xFF) as u8);
        offset = off;
        line = ln as i64;
    }
    out
}
