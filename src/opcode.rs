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
use std::collections::HashMap;

/// The two interpreter versions this crate knows how to talk about.
/// Both tables are constructed side by side in `walk` so a single code
/// object can be read against one and written against the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Py38,
    Py39,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JumpKind {
    Relative,
    Absolute,
}

/// Name/opcode mapping plus jump classification for one interpreter
/// version. Every instruction in the wordcode encoding (3.6+) is 2 bytes
/// regardless of whether its argument is meaningful, so no separate
/// "has argument" query is needed beyond jump classification and name
/// lookup.
pub struct OpcodeTable {
    version: Version,
    by_name: HashMap<&'static str, u8>,
    by_opcode: HashMap<u8, &'static str>,
    jumps: HashMap<&'static str, JumpKind>,
}

/// The `EXTENDED_ARG` opcode has the same name (and, on every CPython
/// version since 3.6, the same numeric value) across both tables.
pub const EXTENDED_ARG: &str = "EXTENDED_ARG";

impl OpcodeTable {
    pub fn for_version(version: Version) -> OpcodeTable {
        let defs: &[(&'static str, u8)] = match version {
            Version::Py38 => PY38_OPCODES,
            Version::Py39 => PY39_OPCODES,
        };
        let jump_defs: &[(&'static str, JumpKind)] = match version {
            Version::Py38 => PY38_JUMPS,
            Version::Py39 => PY39_JUMPS,
        };
        let mut by_name = HashMap::with_capacity(defs.len());
        let mut by_opcode = HashMap::with_capacity(defs.len());
        for (name, op) in defs {
            by_name.insert(*name, *op);
            by_opcode.insert(*op, *name);
        }
        let mut jumps = HashMap::with_capacity(jump_defs.len());
        for (name, kind) in jump_defs {
            jumps.insert(*name, *kind);
        }
        OpcodeTable { version, by_name, by_opcode, jumps }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The opcode integer for a given mnemonic, if this version has it.
    pub fn opcode(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    /// The mnemonic for a given opcode integer, if this version has it.
    pub fn name(&self, opcode: u8) -> Option<&'static str> {
        self.by_opcode.get(&opcode).copied()
    }

    /// True if this opcode is any kind of jump (relative or absolute).
    pub fn is_jump(&self, name: &str) -> bool {
        self.jumps.contains_key(name)
    }

    pub fn is_relative_jump(&self, name: &str) -> bool {
        matches!(self.jumps.get(name), Some(JumpKind::Relative))
    }

    pub fn is_absolute_jump(&self, name: &str) -> bool {
        matches!(self.jumps.get(name), Some(JumpKind::Absolute))
    }
}

/// Size (in bytes) of an instruction encoded with `prefixes` leading
/// `EXTENDED_ARG` instructions. Per §3/§4.1: 2 bytes, plus 2 per
/// wide-argument prefix.
pub fn inst_size(prefixes: usize) -> usize {
    2 + 2 * prefixes
}

/// Number of `EXTENDED_ARG` prefixes required to encode `arg` (0-3,
/// giving up to 32 bits).
pub fn prefixes_for_arg(arg: u32) -> usize {
    if arg > 0x00FF_FFFF {
        3
    } else if arg > 0x0000_FFFF {
        2
    } else if arg > 0x0000_00FF {
        1
    } else {
        0
    }
}

// Opcode values below mirror CPython's `Lib/opcode.py` for the named
// version. Only the mnemonics this crate's rewrite rules or scanner can
// ever see or emit are listed; an unrecognized mnemonic at runtime
// indicates bytecode this crate was never meant to touch, which the
// walker surfaces as a malformed/unsupported error rather than silently
// guessing a size or jump kind for it.
const PY38_OPCODES: &[(&str, u8)] = &[
    ("POP_TOP", 1),
    ("ROT_TWO", 2),
    ("ROT_THREE", 3),
    ("DUP_TOP", 4),
    ("DUP_TOP_TWO", 5),
    ("ROT_FOUR", 6),
    ("NOP", 9),
    ("UNARY_NOT", 12),
    ("BINARY_SUBSCR", 25),
    ("GET_ITER", 68),
    ("BEGIN_FINALLY", 53),
    ("END_ASYNC_FOR", 54),
    ("WITH_CLEANUP_START", 81),
    ("WITH_CLEANUP_FINISH", 82),
    ("RETURN_VALUE", 83),
    ("SETUP_ANNOTATIONS", 85),
    ("YIELD_VALUE", 86),
    ("POP_BLOCK", 87),
    ("END_FINALLY", 88),
    ("POP_EXCEPT", 89),
    ("STORE_NAME", 90),
    ("DELETE_NAME", 91),
    ("UNPACK_SEQUENCE", 92),
    ("FOR_ITER", 93),
    ("STORE_ATTR", 95),
    ("STORE_GLOBAL", 97),
    ("LOAD_CONST", 100),
    ("LOAD_NAME", 101),
    ("BUILD_TUPLE", 102),
    ("BUILD_LIST", 103),
    ("BUILD_MAP", 105),
    ("LOAD_ATTR", 106),
    ("COMPARE_OP", 107),
    ("IMPORT_NAME", 108),
    ("IMPORT_FROM", 109),
    ("JUMP_FORWARD", 110),
    ("JUMP_IF_FALSE_OR_POP", 111),
    ("JUMP_IF_TRUE_OR_POP", 112),
    ("JUMP_ABSOLUTE", 113),
    ("POP_JUMP_IF_FALSE", 114),
    ("POP_JUMP_IF_TRUE", 115),
    ("LOAD_GLOBAL", 116),
    ("SETUP_FINALLY", 122),
    ("LOAD_FAST", 124),
    ("STORE_FAST", 125),
    ("RAISE_VARARGS", 130),
    ("CALL_FUNCTION", 131),
    ("MAKE_FUNCTION", 132),
    ("LOAD_DEREF", 136),
    ("STORE_DEREF", 137),
    ("CALL_FUNCTION_KW", 141),
    ("SETUP_WITH", 143),
    ("EXTENDED_ARG", 144),
    ("LIST_APPEND", 145),
    ("SETUP_ASYNC_WITH", 154),
    ("BUILD_CONST_KEY_MAP", 156),
    ("CALL_FINALLY", 162),
    ("POP_FINALLY", 163),
];

const PY38_JUMPS: &[(&str, JumpKind)] = &[
    ("JUMP_FORWARD", JumpKind::Relative),
    ("FOR_ITER", JumpKind::Relative),
    ("SETUP_FINALLY", JumpKind::Relative),
    ("SETUP_WITH", JumpKind::Relative),
    ("SETUP_ASYNC_WITH", JumpKind::Relative),
    ("CALL_FINALLY", JumpKind::Relative),
    ("JUMP_ABSOLUTE", JumpKind::Absolute),
    ("JUMP_IF_FALSE_OR_POP", JumpKind::Absolute),
    ("JUMP_IF_TRUE_OR_POP", JumpKind::Absolute),
    ("POP_JUMP_IF_FALSE", JumpKind::Absolute),
    ("POP_JUMP_IF_TRUE", JumpKind::Absolute),
];

// 3.9 dropped BEGIN_FINALLY/END_FINALLY/CALL_FINALLY/POP_FINALLY in
// favor of RERAISE, and added IS_OP/CONTAINS_OP/JUMP_IF_NOT_EXC_MATCH.
const PY39_OPCODES: &[(&str, u8)] = &[
    ("POP_TOP", 1),
    ("ROT_TWO", 2),
    ("ROT_THREE", 3),
    ("DUP_TOP", 4),
    ("DUP_TOP_TWO", 5),
    ("ROT_FOUR", 6),
    ("NOP", 9),
    ("UNARY_NOT", 12),
    ("BINARY_SUBSCR", 25),
    ("RERAISE", 48),
    ("WITH_EXCEPT_START", 49),
    ("GET_AITER", 50),
    ("GET_ANEXT", 51),
    ("BEFORE_ASYNC_WITH", 52),
    ("END_ASYNC_FOR", 54),
    ("GET_ITER", 68),
    ("LOAD_ASSERTION_ERROR", 74),
    ("RETURN_VALUE", 83),
    ("SETUP_ANNOTATIONS", 85),
    ("YIELD_VALUE", 86),
    ("POP_BLOCK", 87),
    ("POP_EXCEPT", 89),
    ("STORE_NAME", 90),
    ("DELETE_NAME", 91),
    ("UNPACK_SEQUENCE", 92),
    ("FOR_ITER", 93),
    ("STORE_ATTR", 95),
    ("STORE_GLOBAL", 97),
    ("LOAD_CONST", 100),
    ("LOAD_NAME", 101),
    ("BUILD_TUPLE", 102),
    ("BUILD_LIST", 103),
    ("BUILD_MAP", 105),
    ("LOAD_ATTR", 106),
    ("COMPARE_OP", 107),
    ("IMPORT_NAME", 108),
    ("IMPORT_FROM", 109),
    ("JUMP_FORWARD", 110),
    ("JUMP_IF_FALSE_OR_POP", 111),
    ("JUMP_IF_TRUE_OR_POP", 112),
    ("JUMP_ABSOLUTE", 113),
    ("POP_JUMP_IF_FALSE", 114),
    ("POP_JUMP_IF_TRUE", 115),
    ("LOAD_GLOBAL", 116),
    ("IS_OP", 117),
    ("CONTAINS_OP", 118),
    ("JUMP_IF_NOT_EXC_MATCH", 121),
    ("SETUP_FINALLY", 122),
    ("LOAD_FAST", 124),
    ("STORE_FAST", 125),
    ("RAISE_VARARGS", 130),
    ("CALL_FUNCTION", 131),
    ("MAKE_FUNCTION", 132),
    ("LOAD_DEREF", 136),
    ("STORE_DEREF", 137),
    ("CALL_FUNCTION_KW", 141),
    ("SETUP_WITH", 143),
    ("EXTENDED_ARG", 144),
    ("LIST_APPEND", 145),
    ("SETUP_ASYNC_WITH", 154),
    ("BUILD_CONST_KEY_MAP", 156),
    ("LIST_EXTEND", 162),
];

const PY39_JUMPS: &[(&str, JumpKind)] = &[
    ("JUMP_FORWARD", JumpKind::Relative),
    ("FOR_ITER", JumpKind::Relative),
    ("SETUP_FINALLY", JumpKind::Relative),
    ("SETUP_WITH", JumpKind::Relative),
    ("SETUP_ASYNC_WITH", JumpKind::Relative),
    ("JUMP_ABSOLUTE", JumpKind::Absolute),
    ("JUMP_IF_FALSE_OR_POP", JumpKind::Absolute),
    ("JUMP_IF_TRUE_OR_POP", JumpKind::Absolute),
    ("POP_JUMP_IF_FALSE", JumpKind::Absolute),
    ("POP_JUMP_IF_TRUE", JumpKind::Absolute),
    ("JUMP_IF_NOT_EXC_MATCH", JumpKind::Absolute),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_py38_has_begin_finally_py39_does_not() {
        let py38 = OpcodeTable::for_version(Version::Py38);
        let py39 = OpcodeTable::for_version(Version::Py39);
        assert!(py38.opcode("BEGIN_FINALLY").is_some());
        assert!(py39.opcode("BEGIN_FINALLY").is_none());
        assert!(py39.opcode("RERAISE").is_some());
        assert!(py38.opcode("RERAISE").is_none());
    }

    #[test]
    fn test_jump_classification() {
        let opc = OpcodeTable::for_version(Version::Py39);
        assert!(opc.is_relative_jump("JUMP_FORWARD"));
        assert!(!opc.is_absolute_jump("JUMP_FORWARD"));
        assert!(opc.is_absolute_jump("POP_JUMP_IF_FALSE"));
        assert!(!opc.is_jump("LOAD_CONST"));
    }

    #[test]
    fn test_prefixes_for_arg() {
        assert_eq!(prefixes_for_arg(0), 0);
        assert_eq!(prefixes_for_arg(255), 0);
        assert_eq!(prefixes_for_arg(256), 1);
        assert_eq!(prefixes_for_arg(65535), 1);
        assert_eq!(prefixes_for_arg(65536), 2);
        assert_eq!(prefixes_for_arg(16_777_215), 2);
        assert_eq!(prefixes_for_arg(16_777_216), 3);
    }

    #[test]
    fn test_inst_size() {
        assert_eq!(inst_size(0), 2);
        assert_eq!(inst_size(1), 4);
        assert_eq!(inst_size(3), 8);
    }
}
