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

//! `.pyc` container framing: the 16-byte header in front of the
//! marshalled root code object, and the version magic numbers that
//! identify it. The core version gate (3.9 in, 3.8 out) is enforced by
//! the walker, not here: a caller may legitimately want to inspect a
//! module's version without rewriting it.

use std::fs;
use std::path::Path;

use crate::error::Error;
use crate::marshal::{self, RawCodeObject};

/// Bytes 0-3 of a 3.8 `.pyc` header (magic number 3413, little-endian,
/// with the standard `\r\n` suffix CPython appends to every magic).
pub const PY38_MAGIC: [u8; 4] = [0x55, 0x0D, 0x0D, 0x0A];
/// Bytes 0-3 of a 3.9 `.pyc` header (magic number 3425).
pub const PY39_MAGIC: [u8; 4] = [0x61, 0x0D, 0x0D, 0x0A];

/// Total header size: magic (4) + flags (4) + source mtime (4) + source
/// size (4).
pub const HEADER_LEN: usize = 16;
/// Offset of the little-endian `u32` source-size field within the
/// header.
pub const SOURCE_SIZE_OFFSET: usize = 12;
/// The smallest input this crate will attempt to read: a bare header
/// plus the shortest possible marshalled code object is well over this,
/// so anything smaller is certainly truncated or not a `.pyc` at all.
pub const MIN_PYC_SIZE: u64 = 50;

/// A fully parsed `.pyc` module: its header fields plus the decoded root
/// code object. `is_pypy` is always `false` here; it exists only so this
/// type's shape matches the broader family of bytecode containers this
/// crate's rewrite rules are modeled on.
pub struct ParsedModule {
    pub root: RawCodeObject,
    pub version: (u8, u8),
    pub timestamp: u32,
    pub is_pypy: bool,
}

fn magic_version(magic: &[u8]) -> Option<(u8, u8)> {
    if magic == PY38_MAGIC {
        Some((3, 8))
    } else if magic == PY39_MAGIC {
        Some((3, 9))
    } else {
        None
    }
}

/// Reads and parses a `.pyc` file: header plus marshalled root code
/// object. Does not itself reject a non-3.9 input; that is the walker's
/// job (`Error::WrongVersion`), since reading a module's version without
/// intending to rewrite it is a legitimate, separate use.
pub fn read_module(path: &Path) -> Result<ParsedModule, Error> {
    let bytes = fs::read(path)?;
    if (bytes.len() as u64) < MIN_PYC_SIZE {
        return Err(Error::ContainerIO(format!(
            "{} is {} bytes, smaller than the minimum valid .pyc size of {MIN_PYC_SIZE}",
            path.display(),
            bytes.len()
        )));
    }

    let version = magic_version(&bytes[0..4])
        .ok_or_else(|| Error::ContainerIO(format!("{} has an unrecognized .pyc magic number", path.display())))?;
    let timestamp = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let root = marshal::read_code_object(&bytes[HEADER_LEN..])?;

    Ok(ParsedModule { root, version, timestamp, is_pypy: false })
}

/// Serializes `root` under the 3.8 magic and writes it to `path`. The
/// source-size field is filled in with the size of the freshly
/// marshalled payload itself (matching the "write zero, then seek back
/// and patch the real size" two-step the disassembler pipeline this is
/// grounded on performs, collapsed here into one buffered write since
/// the whole output fits comfortably in memory). Atomic replacement
/// (writing to a `.tmp` sibling and renaming into place) is the
/// caller's responsibility, not this function's: the CLI front end is
/// what knows whether `--force` permits overwriting an existing output
/// path.
pub fn write_module(path: &Path, root: &RawCodeObject, timestamp: u32) -> Result<(), Error> {
    let mut buf = Vec::with_capacity(HEADER_LEN + root.code.len() * 2);
    buf.extend_from_slice(&PY38_MAGIC);
    buf.extend_from_slice(&0u32.to_le_bytes()); // flags
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // source size placeholder
    let payload = marshal::write_code_object(root);
    buf.extend_from_slice(&payload);

    let source_size = payload.len() as u32;
    buf[SOURCE_SIZE_OFFSET..SOURCE_SIZE_OFFSET + 4].copy_from_slice(&source_size.to_le_bytes());

    fs::write(path, buf)?;
    Ok(())
}
