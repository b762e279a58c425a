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

//! In-place editing of one code object's instruction stream. Offsets,
//! labels, and the line table all move together as instructions are
//! popped and inserted; nothing here re-reads the whole stream to
//! recompute state, matching the edit-as-you-go style the rewrite
//! rules depend on.

use std::collections::HashMap;

use crate::error::Error;
use crate::inst::{Argument, CodeObject, Instruction};
use crate::opcode::OpcodeTable;

/// Owns one code object's working state for the duration of a rewrite:
/// the instruction list (via `code`), the label table, and the offset
/// bookkeeping needed to keep both consistent across edits. A backpatch
/// instruction is never tracked separately from the instruction stream
/// itself: it is exactly a jump whose `argument` is still a `Label`
/// rather than a resolved `Imm`, so "is this instruction pending
/// backpatch" is a question `need_backpatch` answers by inspection
/// rather than set membership.
pub struct Patcher<'a> {
    opc: &'a OpcodeTable,
    pub code: &'a mut CodeObject,
    pub label: HashMap<String, usize>,
}

impl<'a> Patcher<'a> {
    pub fn new(opc: &'a OpcodeTable, code: &'a mut CodeObject, label: HashMap<String, usize>) -> Patcher<'a> {
        Patcher { opc, code, label }
    }

    /// True if `inst` is a jump whose target has not yet been resolved
    /// to a numeric offset.
    pub fn need_backpatch(&self, inst: &Instruction) -> bool {
        self.opc.is_jump(&inst.opname) && inst.argument.is_label()
    }

    /// Every labeled instruction's *index* from `idx` onward, mapped to
    /// its label name. Keyed by index rather than offset: a pop or
    /// insert shifts every later instruction's offset by the same
    /// constant amount, so an offset recorded before the edit never
    /// matches any offset after it. Index is the stable handle across
    /// the shift (the caller re-aligns it against the post-edit array).
    fn inst_to_label(&self, idx: usize) -> HashMap<usize, String> {
        let mut out = HashMap::new();
        for (i, inst) in self.code.instructions.iter().enumerate().skip(idx) {
            if let Some(name) = self.label.iter().find(|(_, &off)| off == inst.offset).map(|(n, _)| n.clone()) {
                out.insert(i, name);
            }
        }
        out
    }

    /// Shifts every line-table entry at or after `offset` by `val`
    /// bytes. `allow_equal` controls whether an entry exactly at
    /// `offset` shifts too (true when inserting at that offset, false
    /// when removing the instruction that owned it, since removal
    /// already popped that entry separately).
    pub fn shift_line_no(&mut self, offset: usize, val: i64, allow_equal: bool) {
        let mut offs: Vec<usize> = self.code.line_table.keys().copied().collect();
        offs.sort_unstable();
        let start = offs.iter().position(|&o| o > offset || (allow_equal && o == offset));
        let Some(start) = start else { return };
        for &off in &offs[start..] {
            if let Some(line_no) = self.code.line_table.remove(&off) {
                let shifted = (off as i64 + val).max(0) as usize;
                self.code.line_table.insert(shifted, line_no);
            }
        }
    }

    /// Removes the instruction at `idx`, fixing up every offset, label,
    /// and line-table entry that follows it. Returns the removed
    /// instruction, whether it needed backpatching, its label (if any),
    /// and its line number (if any) so a replacement can preserve
    /// whichever of those the caller needs.
    pub fn pop_inst(&mut self, idx: usize) -> (Instruction, bool, Option<String>, Option<u32>) {
        let old_inst_to_label = self.inst_to_label(idx + 1);
        let popped = self.code.instructions.remove(idx);
        let backpatch = self.need_backpatch(&popped);

        let label = self.label.iter().find(|(_, &off)| off == popped.offset).map(|(name, _)| name.clone());
        if let Some(ref name) = label {
            self.label.remove(name);
        }

        let size = crate::opcode::inst_size(0);
        for (i, inst) in self.code.instructions[idx..].iter_mut().enumerate() {
            inst.offset -= size;
            if let Some(name) = old_inst_to_label.get(&(idx + 1 + i)) {
                self.label.insert(name.clone(), inst.offset);
            }
        }

        let line_no = self.code.line_table.remove(&popped.offset);
        self.shift_line_no(popped.offset, -(size as i64), false);

        (popped, backpatch, label, line_no)
    }

    /// Inserts `inst` at `idx`, computing its offset from the
    /// instruction immediately before it and shifting everything after
    /// it (offsets, labels, line table). `label` installs a new label
    /// name at the inserted offset; `shift_line_no_at_offset` controls
    /// whether a line-table entry already at that exact offset moves
    /// along with the shift or stays put (stays put models a new
    /// instruction inserted at the start of an existing line; moves
    /// models one inserted before it).
    pub fn insert_inst(
        &mut self,
        mut inst: Instruction,
        idx: usize,
        label: Option<String>,
        shift_line_no_at_offset: bool,
    ) -> Result<(), Error> {
        let old_inst_to_label = self.inst_to_label(idx);

        let offset = if idx == 0 { 0 } else { self.code.instructions[idx - 1].offset + crate::opcode::inst_size(0) };
        inst.offset = offset;
        let size = crate::opcode::inst_size(0);

        self.code.instructions.insert(idx, inst);

        if let Some(name) = label {
            if self.label.contains_key(&name) {
                return Err(Error::LabelReuseError(name));
            }
            self.label.insert(name, offset);
        }

        for (i, inst) in self.code.instructions[idx + 1..].iter_mut().enumerate() {
            inst.offset += size;
            if let Some(name) = old_inst_to_label.get(&(idx + i)) {
                self.label.insert(name.clone(), inst.offset);
            }
        }

        self.shift_line_no(offset, size as i64, shift_line_no_at_offset);
        Ok(())
    }

    /// Resolves every still-symbolic jump argument to the numeric
    /// offset its label now points at. Labels are never renamed to a
    /// canonical `L{offset}` form first (unlike the disassembler-text
    /// pipeline this is grounded on): there is no intermediate textual
    /// assembly stage here, so resolving straight to `Imm` is both
    /// sufficient and simpler.
    pub fn fix_backpatch(&mut self) -> Result<(), Error> {
        for inst in &mut self.code.instructions {
            if let Argument::Label(name) = &inst.argument {
                let target = *self
                    .label
                    .get(name)
                    .ok_or_else(|| Error::UnsupportedJump(format!("undefined label {name:?} on {}", inst.opname)))?;
                let arg = if self.opc.is_relative_jump(&inst.opname) {
                    (target as i64 - (inst.offset + crate::opcode::inst_size(0)) as i64) as u32
                } else {
                    target as u32
                };
                inst.argument = Argument::Imm(arg);
            }
        }
        Ok(())
    }

    /// Assigns each instruction the line number of the line-table
    /// region its offset falls in.
    pub fn fix_line_no(&mut self) {
        let mut offs: Vec<usize> = self.code.line_table.keys().copied().collect();
        offs.sort_unstable();
        for inst in &mut self.code.instructions {
            let mut current = None;
            for &off in &offs {
                if off <= inst.offset {
                    current = Some(off);
                } else {
                    break;
                }
            }
            inst.line_no = current.map(|off| self.code.line_table[&off]);
        }
    }

    /// Runs the full fix-up pass once all rewrite rules have been
    /// applied: resolve backpatch targets, then assign final line
    /// numbers.
    pub fn fix_all(&mut self) -> Result<(), Error> {
        self.fix_backpatch()?;
        self.fix_line_no();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::CodeMetadata;
    use crate::opcode::Version;
    use std::collections::BTreeMap;

    fn test_code() -> CodeObject {
        CodeObject {
            instructions: vec![],
            constants: vec![],
            varnames: vec![],
            freevars: vec![],
            cellvars: vec![],
            names: vec![],
            first_line_no: 1,
            line_table: BTreeMap::new(),
            metadata: CodeMetadata {
                name: "test".into(),
                filename: "<test>".into(),
                argcount: 0,
                kwonlyargcount: 0,
                nlocals: 0,
                stacksize: 0,
                flags: 0,
            },
        }
    }

    #[test]
    fn test_pop_inst_shifts_offsets() {
        let opc = OpcodeTable::for_version(Version::Py38);
        let mut code = test_code();
        code.instructions.push(Instruction { offset: 0, ..Instruction::new(&opc, "NOP", Argument::Imm(0)) });
        code.instructions.push(Instruction { offset: 2, ..Instruction::new(&opc, "POP_TOP", Argument::Imm(0)) });
        code.instructions.push(Instruction { offset: 4, ..Instruction::new(&opc, "RETURN_VALUE", Argument::Imm(0)) });
        let mut patcher = Patcher::new(&opc, &mut code, HashMap::new());
        let (popped, backpatch, label, _) = patcher.pop_inst(0);
        assert_eq!(popped.opname, "NOP");
        assert!(!backpatch);
        assert!(label.is_none());
        assert_eq!(patcher.code.instructions[0].offset, 0);
        assert_eq!(patcher.code.instructions[1].offset, 2);
    }

    #[test]
    fn test_insert_inst_shifts_labels() {
        let opc = OpcodeTable::for_version(Version::Py38);
        let mut code = test_code();
        code.instructions.push(Instruction { offset: 0, ..Instruction::new(&opc, "NOP", Argument::Imm(0)) });
        code.instructions.push(Instruction { offset: 2, ..Instruction::new(&opc, "RETURN_VALUE", Argument::Imm(0)) });
        let mut labels = HashMap::new();
        labels.insert("L2".to_string(), 2);
        let mut patcher = Patcher::new(&opc, &mut code, labels);
        let new_inst = Instruction::new(&opc, "POP_TOP", Argument::Imm(0));
        patcher.insert_inst(new_inst, 1, None, false).unwrap();
        assert_eq!(patcher.label["L2"], 4);
        assert_eq!(patcher.code.instructions[2].opname, "RETURN_VALUE");
        assert_eq!(patcher.code.instructions[2].offset, 4);
    }

    #[test]
    fn test_pop_inst_twice_keeps_downstream_label_correct() {
        // A labeled instruction two positions past two instructions that
        // each get popped in turn must end up labeled at its true final
        // offset, not at some offset left over from an earlier pop.
        let opc = OpcodeTable::for_version(Version::Py38);
        let mut code = test_code();
        code.instructions.push(Instruction { offset: 0, ..Instruction::new(&opc, "NOP", Argument::Imm(0)) });
        code.instructions.push(Instruction { offset: 2, ..Instruction::new(&opc, "NOP", Argument::Imm(0)) });
        code.instructions.push(Instruction { offset: 4, ..Instruction::new(&opc, "RETURN_VALUE", Argument::Imm(0)) });
        let mut labels = HashMap::new();
        labels.insert("L4".to_string(), 4);
        let mut patcher = Patcher::new(&opc, &mut code, labels);
        patcher.pop_inst(0);
        patcher.pop_inst(0);
        assert_eq!(patcher.label["L4"], 0);
        assert_eq!(patcher.code.instructions[0].offset, 0);
    }

    #[test]
    fn test_fix_backpatch_resolves_relative_jump() {
        let opc = OpcodeTable::for_version(Version::Py38);
        let mut code = test_code();
        code.instructions.push(Instruction {
            offset: 0,
            ..Instruction::new(&opc, "JUMP_FORWARD", Argument::Label("LTARGET".into()))
        });
        code.instructions.push(Instruction { offset: 2, ..Instruction::new(&opc, "NOP", Argument::Imm(0)) });
        code.instructions.push(Instruction { offset: 4, ..Instruction::new(&opc, "RETURN_VALUE", Argument::Imm(0)) });
        let mut labels = HashMap::new();
        labels.insert("LTARGET".to_string(), 4);
        let mut patcher = Patcher::new(&opc, &mut code, labels);
        patcher.fix_backpatch().unwrap();
        assert_eq!(patcher.code.instructions[0].argument.as_imm(), Some(2));
    }
}
