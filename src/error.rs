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
use std::fmt;
use std::io;

/// Everything that can go wrong while downgrading a module. Every
/// variant is fatal to the conversion of the code object it names (and,
/// by extension, to the whole module, since partial rewrites are never
/// emitted).
#[derive(Debug)]
pub enum Error {
    /// The input module does not report interpreter version 3.9.
    WrongVersion { major: u8, minor: u8 },
    /// A `SETUP_FINALLY`/`POP_BLOCK`/`JUMP_FORWARD`/`END_FINALLY` region
    /// does not match the shape the 3.9 compiler emits.
    MalformedFinally(String),
    /// A rewrite attempted to install a label name that already exists.
    LabelReuseError(String),
    /// A backpatch instruction's opcode is not classified as relative or
    /// absolute in the opcode table.
    UnsupportedJump(String),
    /// The constants pool references a nested code object for which the
    /// walker produced no rewritten counterpart.
    MissingNestedCode(String),
    /// The upstream disassembler, downstream assembler, or plain file
    /// I/O failed.
    ContainerIO(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::WrongVersion { major, minor } => {
                write!(f, "input bytecode version {major}.{minor} is not 3.9")
            }
            Error::MalformedFinally(msg) => write!(f, "malformed finally region: {msg}"),
            Error::LabelReuseError(label) => write!(f, "label {label:?} already exists"),
            Error::UnsupportedJump(opname) => {
                write!(f, "{opname} is neither a relative nor an absolute jump")
            }
            Error::MissingNestedCode(name) => {
                write!(f, "no rewritten counterpart produced for nested code {name:?}")
            }
            Error::ContainerIO(msg) => write!(f, "container I/O failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::ContainerIO(e.to_string())
    }
}
