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

//! The 3.9 -> 3.8 rewrite rules, applied in a fixed order against a
//! single `Patcher`. Rules 1 and 2 are one-for-one/one-for-many
//! substitutions driven by `search`; rules 3 and 4 perform bulk
//! deletions across many call sites and track index drift with a
//! shared edit history instead of re-scanning the live instruction
//! list after every edit.

use std::collections::HashMap;

use crate::config::Config;
use crate::error::Error;
use crate::inst::{Argument, Instruction};
use crate::marshal::Value;
use crate::opcode::OpcodeTable;
use crate::patch::Patcher;
use crate::scan::{self, FinallyDescriptor};
use crate::search;

/// `(idx, delta)` pairs recording, in order, how many instructions
/// were inserted (positive) or removed (negative) at an original
/// index. `recalc_idx` folds this history onto an index computed
/// before any of the edits happened.
pub type EditHistory = Vec<(usize, i64)>;

pub fn recalc_idx(history: &EditHistory, idx: usize) -> usize {
    let mut idx = idx as i64;
    for &(hidx, delta) in history {
        if idx > hidx as i64 {
            idx += delta;
        }
    }
    idx as usize
}

/// Rule 1: `JUMP_IF_NOT_EXC_MATCH target` -> `COMPARE_OP 10;
/// POP_JUMP_IF_FALSE target`. 10 is `PyCmp_EXC_MATCH`, the comparison
/// code 3.8's exception matching is expressed with.
const EXC_MATCH_COMPARE_OP_ARG: u32 = 10;

fn expand_exc_match(opc: &OpcodeTable, patcher: &mut Patcher) -> Result<usize, Error> {
    search::replace_op_with_insts(patcher, "JUMP_IF_NOT_EXC_MATCH", |old| {
        vec![
            Instruction::new(opc, "COMPARE_OP", Argument::Imm(EXC_MATCH_COMPARE_OP_ARG)),
            Instruction::new(opc, "POP_JUMP_IF_FALSE", old.argument),
        ]
    })
}

/// Rule 2: `RERAISE arg` -> `END_FINALLY arg`.
fn rename_reraise(opc: &OpcodeTable, patcher: &mut Patcher) -> Result<usize, Error> {
    search::replace_op_with_inst(patcher, "RERAISE", |old| {
        Instruction { opname: "END_FINALLY".to_string(), opcode: opc.opcode("END_FINALLY").expect("38 table has END_FINALLY"), ..old }
    })
}

/// Rule 3: demotes the `LOAD_CONST <tuple>; BUILD_LIST 0; LIST_EXTEND
/// 1` peephole pattern back into one `LOAD_CONST` per element followed
/// by `BUILD_LIST n`. Tuple elements are appended to the constants
/// pool once per distinct source tuple and shared across repeated
/// occurrences of the same pattern.
fn demote_list_from_tuple(opc: &OpcodeTable, patcher: &mut Patcher) -> Result<(), Error> {
    let records = scan::scan_list_from_tuple(patcher);
    let mut history: EditHistory = Vec::new();
    let mut const_map: HashMap<usize, (usize, usize)> = HashMap::new();
    let mut warned_nested_tuple = false;

    for record in records {
        if let std::collections::hash_map::Entry::Vacant(entry) = const_map.entry(record.const_idx) {
            let elems = match &patcher.code.constants[record.const_idx] {
                Value::Tuple(items) => items.clone(),
                other => {
                    return Err(Error::MalformedFinally(format!(
                        "list-from-tuple record points at a non-tuple constant: {other:?}"
                    )))
                }
            };
            entry.insert((patcher.code.constants.len(), elems.len()));
            for elem in elems {
                if matches!(elem, Value::Tuple(_)) && !warned_nested_tuple {
                    log::warn!(
                        "list literal contains a nested tuple constant; downstream decompilers are known to mishandle this shape"
                    );
                    warned_nested_tuple = true;
                }
                patcher.code.constants.push(elem);
            }
        }
        let (first_elem, elem_count) = const_map[&record.const_idx];

        let idx = recalc_idx(&history, record.inst_idx);
        let (_, _, label, line_no) = patcher.pop_inst(idx);
        patcher.pop_inst(idx);
        patcher.pop_inst(idx);

        for i in 0..elem_count {
            let inst = Instruction::new(opc, "LOAD_CONST", Argument::Imm((first_elem + i) as u32));
            let this_label = if i == 0 { label.clone() } else { None };
            patcher.insert_inst(inst, idx + i, this_label, false)?;
            if i == 0 {
                if let Some(line_no) = line_no {
                    let offset = patcher.code.instructions[idx].offset;
                    patcher.code.line_table.insert(offset, line_no);
                }
            }
        }
        let build_list = Instruction::new(opc, "BUILD_LIST", Argument::Imm(elem_count as u32));
        patcher.insert_inst(build_list, idx + elem_count, None, true)?;

        history.push((record.inst_idx, -3 + elem_count as i64 + 1));
    }
    Ok(())
}

/// Rule 4: pre-order sweep over the finally-descriptor forest,
/// collapsing each node's duplicate block1/JUMP_FORWARD into a single
/// `BEGIN_FINALLY`. Carries one edit history across the whole
/// traversal since every node edits the same instruction list.
fn synthesize_begin_finally(
    opc: &OpcodeTable,
    patcher: &mut Patcher,
    history: &mut EditHistory,
    descriptors: Vec<FinallyDescriptor>,
) -> Result<(), Error> {
    let mut children = Vec::new();

    for d in &descriptors {
        let count = d.block1.length + 1;
        let start = recalc_idx(history, d.block1.start);
        let mut line_nos = Vec::new();
        for _ in 0..count {
            let (_, _, _, line_no) = patcher.pop_inst(start);
            if let Some(line_no) = line_no {
                line_nos.push(line_no);
            }
        }
        history.push((d.block1.start, -(count as i64)));

        let insert_idx = recalc_idx(history, d.block1.start);
        let begin_finally = Instruction::new(opc, "BEGIN_FINALLY", Argument::Imm(0));
        patcher.insert_inst(begin_finally, insert_idx, None, true)?;
        history.push((d.block1.start, 1));

        if let Some(&min_line) = line_nos.iter().min() {
            let block2_idx = recalc_idx(history, d.block2.start);
            let offset = patcher.code.instructions[block2_idx].offset;
            patcher.code.line_table.insert(offset, min_line);
        }
    }

    for d in descriptors {
        children.extend(d.scope_children);
        children.extend(d.block2_children);
    }

    if !children.is_empty() {
        synthesize_begin_finally(opc, patcher, history, children)?;
    }
    Ok(())
}

/// Applies all four rules, in the declared order, against `patcher`.
/// `target_opc` is the 3.8 opcode table new instructions are built
/// against.
pub fn apply_rules(target_opc: &OpcodeTable, patcher: &mut Patcher, cfg: &Config) -> Result<(), Error> {
    expand_exc_match(target_opc, patcher)?;
    rename_reraise(target_opc, patcher)?;
    demote_list_from_tuple(target_opc, patcher)?;
    if !cfg.no_begin_finally {
        let flat = scan::scan_finally(patcher)?;
        let forest = scan::parse_hierarchy(flat);
        let mut history = Vec::new();
        synthesize_begin_finally(target_opc, patcher, &mut history, forest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::{CodeMetadata, CodeObject};
    use crate::opcode::Version;
    use std::collections::BTreeMap;

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
    fn test_recalc_idx_monotonic_after_insertions() {
        let history = vec![(2usize, 3i64), (5, -1)];
        assert_eq!(recalc_idx(&history, 1), 1);
        assert_eq!(recalc_idx(&history, 3), 6);
        assert_eq!(recalc_idx(&history, 6), 8);
    }

    #[test]
    fn test_expand_exc_match() {
        let opc38 = OpcodeTable::for_version(Version::Py38);
        let opc39 = OpcodeTable::for_version(Version::Py39);
        let insts = vec![
            Instruction { offset: 0, ..Instruction::new(&opc39, "JUMP_IF_NOT_EXC_MATCH", Argument::Imm(10)) },
            Instruction { offset: 2, ..Instruction::new(&opc39, "RETURN_VALUE", Argument::Imm(0)) },
        ];
        let mut code = test_code(insts);
        let mut patcher = Patcher::new(&opc39, &mut code, HashMap::new());
        let count = expand_exc_match(&opc38, &mut patcher).unwrap();
        assert_eq!(count, 1);
        assert_eq!(patcher.code.instructions[0].opname, "COMPARE_OP");
        assert_eq!(patcher.code.instructions[0].argument.as_imm(), Some(EXC_MATCH_COMPARE_OP_ARG));
        assert_eq!(patcher.code.instructions[1].opname, "POP_JUMP_IF_FALSE");
    }

    #[test]
    fn test_demote_list_from_tuple_shares_elements_across_repeats() {
        let opc39 = OpcodeTable::for_version(Version::Py39);
        let insts = vec![
            Instruction { offset: 0, ..Instruction::new(&opc39, "LOAD_CONST", Argument::Imm(0)) },
            Instruction { offset: 2, ..Instruction::new(&opc39, "BUILD_LIST", Argument::Imm(0)) },
            Instruction { offset: 4, ..Instruction::new(&opc39, "LIST_EXTEND", Argument::Imm(1)) },
            Instruction { offset: 6, ..Instruction::new(&opc39, "LOAD_CONST", Argument::Imm(0)) },
            Instruction { offset: 8, ..Instruction::new(&opc39, "BUILD_LIST", Argument::Imm(0)) },
            Instruction { offset: 10, ..Instruction::new(&opc39, "LIST_EXTEND", Argument::Imm(1)) },
        ];
        let mut code = test_code(insts);
        code.constants.push(Value::Tuple(vec![Value::Int(1), Value::Int(2)]));
        let mut patcher = Patcher::new(&opc39, &mut code, HashMap::new());
        demote_list_from_tuple(&opc39, &mut patcher).unwrap();
        assert_eq!(patcher.code.constants.len(), 3);
        let opnames: Vec<&str> = patcher.code.instructions.iter().map(|i| i.opname.as_str()).collect();
        assert_eq!(opnames, vec!["LOAD_CONST", "LOAD_CONST", "BUILD_LIST", "LOAD_CONST", "LOAD_CONST", "BUILD_LIST"]);
    }
}
