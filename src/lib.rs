//! Downgrades a compiled Python 3.9 bytecode module into one accepted by
//! the 3.8 interpreter. The conversion is lossless for the supported
//! subset of bytecode shapes but not source-symmetric: some 3.9
//! single-instruction idioms are expanded into multi-instruction 3.8
//! equivalents.
//!
//! [`walk`] is the entry point: it drives a [`container`]-parsed module
//! through the patcher (`patch`), structural scanner (`scan`) and rewrite
//! rules (`rules`) for every code object reachable from the root,
//! including those nested in the constants pool.

/// Per-interpreter-version opcode tables: name/opcode mapping, jump
/// classification, instruction sizing.
pub mod opcode;
/// The mutable instruction/code-object data model shared by every other
/// component.
pub mod inst;
/// In-place edit primitives that keep offsets, labels and the
/// line-number map consistent after every mutation.
pub mod patch;
/// Search and bulk replace helpers built on top of the patcher.
pub mod search;
/// Recognizes `try/finally` regions and the list-from-tuple peephole
/// shape in 3.9 bytecode.
pub mod scan;
/// The 3.9-to-3.8 rewrite rules themselves.
pub mod rules;
/// Per-code-object driver: strips/re-inserts wide-argument prefixes and
/// applies the rule set.
pub mod walk;
/// A minimal reader/writer for the subset of the CPython `marshal`
/// format needed to walk and rebuild a code object graph.
pub mod marshal;
/// Module-file framing: header parsing, version gating, and the
/// source-size patch-up performed after serialization.
pub mod container;
/// Error and warning types shared across the crate.
pub mod error;
/// User-configurable toggles threaded through the walker and rules.
pub mod config;

pub use error::Error;
pub use config::Config;
