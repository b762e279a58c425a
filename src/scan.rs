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

//! Recognizes structural shapes in a 3.9 instruction stream that the
//! rewrite rules act on: `try/finally` regions (with their nesting
//! hierarchy) and the constant-list peephole pattern.

use crate::error::Error;
use crate::inst::Argument;
use crate::marshal::Value;
use crate::patch::Patcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub start: usize,
    pub end: usize,
    pub length: usize,
}

pub type FinallyBlock = Scope;

/// One recognized `try: ... finally: ...` region, with its children
/// bucketed by which part of the parent they were found in. Only
/// `scope_children` and `block2_children` are carried forward by the
/// finally-synthesis rule; `block1_children` exist for completeness of
/// the scan (and are reported here) but the rewrite drops them, since
/// block1 is deleted wholesale.
#[derive(Debug, Clone)]
pub struct FinallyDescriptor {
    pub setup_finally_idx: usize,
    pub pop_block_idx: usize,
    pub scope: Scope,
    pub block1: FinallyBlock,
    pub jump_forward_idx: usize,
    pub block2: FinallyBlock,
    pub end_finally_idx: usize,
    pub scope_children: Vec<FinallyDescriptor>,
    pub block1_children: Vec<FinallyDescriptor>,
    pub block2_children: Vec<FinallyDescriptor>,
}

fn line_no_at(line_table: &std::collections::BTreeMap<usize, u32>, offset: usize) -> Option<u32> {
    line_table.range(..=offset).next_back().map(|(_, &line)| line)
}

struct PartialFinally {
    setup_finally_idx: usize,
    pop_block_idx: usize,
    scope_start: usize,
    block2_start: usize,
}

/// Scans `patcher`'s instructions for `try/finally` regions, validates
/// each candidate's structural duplication, and returns the flat list
/// of confirmed descriptors (hierarchy not yet parsed — see
/// `parse_hierarchy`).
pub fn scan_finally(patcher: &Patcher) -> Result<Vec<FinallyDescriptor>, Error> {
    let insts = &patcher.code.instructions;
    let mut stack: Vec<PartialFinally> = Vec::new();
    let mut candidates: Vec<(usize, usize, Scope, usize)> = Vec::new();

    for (i, inst) in insts.iter().enumerate() {
        match inst.opname.as_str() {
            "SETUP_FINALLY" => {
                let label = inst
                    .argument
                    .as_label()
                    .ok_or_else(|| Error::MalformedFinally(format!("SETUP_FINALLY at {i} has a resolved argument")))?;
                let block2_offset = *patcher
                    .label
                    .get(label)
                    .ok_or_else(|| Error::MalformedFinally(format!("undefined label {label:?} on SETUP_FINALLY at {i}")))?;
                let block2_start = patcher.code.find_inst_index(block2_offset).ok_or_else(|| {
                    Error::MalformedFinally(format!("cannot find block2 for finally at {i}"))
                })?;
                stack.push(PartialFinally { setup_finally_idx: i, pop_block_idx: usize::MAX, scope_start: i + 1, block2_start });
            }
            "POP_BLOCK" => {
                let mut top = stack.pop().ok_or_else(|| Error::MalformedFinally(format!("unmatched POP_BLOCK at {i}")))?;
                top.pop_block_idx = i;
                let scope_len = top.pop_block_idx - top.setup_finally_idx - 1;
                let scope = Scope { start: top.scope_start, end: top.pop_block_idx.saturating_sub(1), length: scope_len };
                candidates.push((top.setup_finally_idx, top.pop_block_idx, scope, top.block2_start));
            }
            _ => {}
        }
    }

    if let Some(top) = stack.first() {
        return Err(Error::MalformedFinally(format!("unmatched finally, the first one is at {}", top.setup_finally_idx)));
    }

    let mut descriptors = Vec::new();
    for (setup_finally_idx, pop_block_idx, scope, block2_start) in candidates {
        let jump_forward_idx = block2_start - 1;
        if jump_forward_idx == pop_block_idx {
            continue;
        }
        if insts[jump_forward_idx].opname != "JUMP_FORWARD" {
            return Err(Error::MalformedFinally(format!(
                "finally at {setup_finally_idx} is invalid: {jump_forward_idx} should be JUMP_FORWARD or POP_BLOCK, found {}",
                insts[jump_forward_idx].opname
            )));
        }
        let block1_len = jump_forward_idx - pop_block_idx - 1;
        if block1_len == 0 {
            continue;
        }
        let block1 = FinallyBlock { start: pop_block_idx + 1, end: jump_forward_idx - 1, length: block1_len };
        let block2 = FinallyBlock { start: block2_start, end: block2_start + block1_len - 1, length: block1_len };

        for j in 0..block1_len {
            let a = &insts[block1.start + j];
            let b = &insts[block2.start + j];
            let a_line = line_no_at(&patcher.code.line_table, a.offset);
            let b_line = line_no_at(&patcher.code.line_table, b.offset);
            if a.opname != b.opname || a_line != b_line {
                return Err(Error::MalformedFinally(format!(
                    "finally at {setup_finally_idx} is invalid: block2 inst #{j} differs from block1"
                )));
            }
            if patcher.need_backpatch(a) {
                let a_target = *patcher.label.get(a.argument.as_label().unwrap()).ok_or_else(|| {
                    Error::MalformedFinally(format!("undefined label on block1 inst #{j} of finally at {setup_finally_idx}"))
                })?;
                let b_target = *patcher.label.get(b.argument.as_label().unwrap()).ok_or_else(|| {
                    Error::MalformedFinally(format!("undefined label on block2 inst #{j} of finally at {setup_finally_idx}"))
                })?;
                let a_rel = a_target as i64 - a.offset as i64;
                let b_rel = b_target as i64 - b.offset as i64;
                if a_rel != b_rel {
                    return Err(Error::MalformedFinally(format!(
                        "finally at {setup_finally_idx} is invalid: block2 inst #{j} jump displacement {b_rel} differs from block1's {a_rel}"
                    )));
                }
            } else if a.argument != b.argument {
                return Err(Error::MalformedFinally(format!(
                    "finally at {setup_finally_idx} is invalid: block2 inst #{j} argument differs from block1"
                )));
            }
        }

        let end_finally_idx = block2.end + 1;
        if insts.get(end_finally_idx).map(|i| i.opname.as_str()) != Some("END_FINALLY") {
            return Err(Error::MalformedFinally(format!(
                "finally at {setup_finally_idx} is invalid: {end_finally_idx} should be END_FINALLY"
            )));
        }

        descriptors.push(FinallyDescriptor {
            setup_finally_idx,
            pop_block_idx,
            scope,
            block1,
            jump_forward_idx,
            block2,
            end_finally_idx,
            scope_children: Vec::new(),
            block1_children: Vec::new(),
            block2_children: Vec::new(),
        });
    }

    Ok(descriptors)
}

/// Buckets descriptors into a forest: each non-root descriptor is
/// filed under whichever of its parent's scope/block1/block2 contains
/// its `setup_finally_idx`, recursively.
pub fn parse_hierarchy(mut flat: Vec<FinallyDescriptor>) -> Vec<FinallyDescriptor> {
    flat.sort_by_key(|d| d.setup_finally_idx);
    let mut roots = Vec::new();
    let mut remaining = flat;
    while !remaining.is_empty() {
        let root = remaining.remove(0);
        let (scope_children, rest): (Vec<_>, Vec<_>) =
            remaining.into_iter().partition(|d| d.setup_finally_idx >= root.scope.start && d.setup_finally_idx <= root.scope.end);
        let (block1_children, rest): (Vec<_>, Vec<_>) =
            rest.into_iter().partition(|d| d.setup_finally_idx >= root.block1.start && d.setup_finally_idx <= root.block1.end);
        let (block2_children, rest): (Vec<_>, Vec<_>) =
            rest.into_iter().partition(|d| d.setup_finally_idx >= root.block2.start && d.setup_finally_idx <= root.block2.end);
        let mut root = root;
        root.scope_children = parse_hierarchy(scope_children);
        root.block1_children = parse_hierarchy(block1_children);
        root.block2_children = parse_hierarchy(block2_children);
        roots.push(root);
        remaining = rest;
    }
    roots
}

/// One occurrence of the 3.9 constant-list peephole pattern:
/// `LOAD_CONST <tuple>`, `BUILD_LIST 0`, `LIST_EXTEND 1`, recognized at
/// `inst_idx` with the tuple living at `const_idx` in the constants
/// pool.
#[derive(Debug, Clone, Copy)]
pub struct ListFromTuple {
    pub inst_idx: usize,
    pub const_idx: usize,
}

/// Scans for the list-from-tuple peephole pattern. A match requires
/// the constant loaded to actually be a tuple: a `LOAD_CONST` of a
/// non-tuple followed by `BUILD_LIST 0`/`LIST_EXTEND 1` is not this
/// pattern (and not valid 3.9 output for a constant list anyway).
pub fn scan_list_from_tuple(patcher: &Patcher) -> Vec<ListFromTuple> {
    let insts = &patcher.code.instructions;
    let mut out = Vec::new();
    let mut i = 0;
    while i + 2 < insts.len() {
        let (a, b, c) = (&insts[i], &insts[i + 1], &insts[i + 2]);
        if a.opname == "LOAD_CONST" && b.opname == "BUILD_LIST" && c.opname == "LIST_EXTEND" {
            if let (Some(const_idx), Some(0), Some(1)) = (a.argument.as_imm(), b.argument.as_imm(), c.argument.as_imm()) {
                if matches!(patcher.code.constants.get(const_idx as usize), Some(Value::Tuple(_))) {
                    out.push(ListFromTuple { inst_idx: i, const_idx: const_idx as usize });
                }
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::{CodeMetadata, CodeObject, Instruction};
    use crate::opcode::{OpcodeTable, Version};
    use std::collections::{BTreeMap, HashMap};

    fn test_code(insts: Vec<Instruction>) -> CodeObject {
        CodeObject {
            instructions: insts,
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
    fn test_scan_finally_recognizes_simple_region() {
        let opc = OpcodeTable::for_version(Version::Py39);
        let insts = vec![
            Instruction { offset: 0, ..Instruction::new(&opc, "SETUP_FINALLY", Argument::Label("Lb2".into())) },
            Instruction { offset: 2, ..Instruction::new(&opc, "NOP", Argument::Imm(0)) },
            Instruction { offset: 4, ..Instruction::new(&opc, "POP_BLOCK", Argument::Imm(0)) },
            Instruction { offset: 6, ..Instruction::new(&opc, "LOAD_CONST", Argument::Imm(0)) },
            Instruction { offset: 8, ..Instruction::new(&opc, "JUMP_FORWARD", Argument::Label("Lend".into())) },
            Instruction { offset: 10, ..Instruction::new(&opc, "LOAD_CONST", Argument::Imm(0)) },
            Instruction { offset: 12, ..Instruction::new(&opc, "RERAISE", Argument::Imm(0)) },
        ];
        let mut code = test_code(insts);
        code.instructions[6].opname = "END_FINALLY".to_string();
        let mut labels = HashMap::new();
        labels.insert("Lb2".to_string(), 10);
        labels.insert("Lend".to_string(), 14);
        let mut patcher = Patcher::new(&opc, &mut code, labels);
        let descriptors = scan_finally(&patcher).unwrap();
        assert_eq!(descriptors.len(), 1);
        let d = &descriptors[0];
        assert_eq!(d.setup_finally_idx, 0);
        assert_eq!(d.pop_block_idx, 2);
        assert_eq!(d.block1, FinallyBlock { start: 3, end: 3, length: 1 });
        assert_eq!(d.block2, FinallyBlock { start: 5, end: 5, length: 1 });
        assert_eq!(d.end_finally_idx, 6);
    }

    #[test]
    fn test_scan_finally_discards_except_without_finally() {
        let opc = OpcodeTable::for_version(Version::Py39);
        let insts = vec![
            Instruction { offset: 0, ..Instruction::new(&opc, "SETUP_FINALLY", Argument::Label("Lb2".into())) },
            Instruction { offset: 2, ..Instruction::new(&opc, "POP_BLOCK", Argument::Imm(0)) },
            Instruction { offset: 4, ..Instruction::new(&opc, "NOP", Argument::Imm(0)) },
        ];
        let mut code = test_code(insts);
        let mut labels = HashMap::new();
        labels.insert("Lb2".to_string(), 4);
        let mut patcher = Patcher::new(&opc, &mut code, labels);
        let descriptors = scan_finally(&patcher).unwrap();
        assert!(descriptors.is_empty());
    }

    #[test]
    fn test_scan_list_from_tuple() {
        let opc = OpcodeTable::for_version(Version::Py39);
        let insts = vec![
            Instruction { offset: 0, ..Instruction::new(&opc, "LOAD_CONST", Argument::Imm(0)) },
            Instruction { offset: 2, ..Instruction::new(&opc, "BUILD_LIST", Argument::Imm(0)) },
            Instruction { offset: 4, ..Instruction::new(&opc, "LIST_EXTEND", Argument::Imm(1)) },
            Instruction { offset: 6, ..Instruction::new(&opc, "RETURN_VALUE", Argument::Imm(0)) },
        ];
        let mut code = test_code(insts);
        code.constants.push(Value::Tuple(vec![Value::Int(1), Value::Int(2)]));
        let patcher = Patcher::new(&opc, &mut code, HashMap::new());
        let records = scan_list_from_tuple(&patcher);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].inst_idx, 0);
        assert_eq!(records[0].const_idx, 0);
    }
}
