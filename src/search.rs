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

//! Pattern-matching helpers built on top of `Patcher`: find an
//! instruction by opname or offset, replace it (one-for-one or
//! one-for-many) while preserving its label, remove a run of
//! instructions outright.

use crate::error::Error;
use crate::inst::Instruction;
use crate::patch::Patcher;

/// Index of the first instruction named `opname`, or `None`.
pub fn find_op(insts: &[Instruction], opname: &str) -> Option<usize> {
    insts.iter().position(|i| i.opname == opname)
}

/// Index of the instruction at exactly `offset`, or `None`.
pub fn find_inst_at_offset(insts: &[Instruction], offset: usize) -> Option<usize> {
    insts.iter().position(|i| i.offset == offset)
}

fn insert_many(
    patcher: &mut Patcher,
    idx: usize,
    insts: Vec<Instruction>,
    label: Option<String>,
    line_no: Option<u32>,
) -> Result<(), Error> {
    for (i, inst) in insts.into_iter().enumerate() {
        let this_label = if i == 0 { label.clone() } else { None };
        patcher.insert_inst(inst, idx + i, this_label, i == 0)?;
        if i == 0 {
            if let Some(ln) = line_no {
                let offset = patcher.code.instructions[idx].offset;
                patcher.code.line_table.insert(offset, ln);
            }
        }
    }
    Ok(())
}

/// Replaces every instruction named `opname` with the single
/// instruction `callback` produces from it, preserving the original's
/// label and line number across the swap.
pub fn replace_op_with_inst(
    patcher: &mut Patcher,
    opname: &str,
    mut callback: impl FnMut(Instruction) -> Instruction,
) -> Result<usize, Error> {
    let mut count = 0;
    while let Some(idx) = find_op(&patcher.code.instructions, opname) {
        let (inst, _, label, line_no) = patcher.pop_inst(idx);
        let replacement = callback(inst);
        patcher.insert_inst(replacement, idx, label, true)?;
        if let Some(ln) = line_no {
            let offset = patcher.code.instructions[idx].offset;
            patcher.code.line_table.insert(offset, ln);
        }
        count += 1;
    }
    Ok(count)
}

/// Replaces every instruction named `opname` with the sequence
/// `callback` produces from it; the first replacement instruction
/// carries the original's label and line number, the rest carry
/// neither.
pub fn replace_op_with_insts(
    patcher: &mut Patcher,
    opname: &str,
    mut callback: impl FnMut(Instruction) -> Vec<Instruction>,
) -> Result<usize, Error> {
    let mut count = 0;
    while let Some(idx) = find_op(&patcher.code.instructions, opname) {
        let (inst, _, label, line_no) = patcher.pop_inst(idx);
        let replacement = callback(inst);
        insert_many(patcher, idx, replacement, label, line_no)?;
        count += 1;
    }
    Ok(count)
}

/// Removal record for one instruction popped by `remove_insts`: the
/// instruction itself, whether it needed backpatching, its label (if
/// any), and its line number (if any) — enough for a caller to
/// redistribute line numbers or labels across whatever replaces the run.
pub type Removal = (Instruction, bool, Option<String>, Option<u32>);

/// Pops `count` consecutive instructions at `idx` outright (no
/// replacement is inserted), returning the full removal record for
/// each so callers can redistribute line numbers and labels.
pub fn remove_insts(patcher: &mut Patcher, idx: usize, count: usize) -> Vec<Removal> {
    let mut removed = Vec::with_capacity(count);
    for _ in 0..count {
        removed.push(patcher.pop_inst(idx));
    }
    removed
}
