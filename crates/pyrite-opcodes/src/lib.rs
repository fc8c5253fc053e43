//! Opcode tables for CPython 2.5, 2.6, and 2.7 bytecode.
//!
//! A scanner working on serialized 2.x code objects cannot use the host
//! interpreter's `dis` module, and the instruction sets differ between
//! minor versions (`JUMP_IF_FALSE` is a relative jump through 2.6 and is
//! replaced by the absolute `POP_JUMP_IF_FALSE` in 2.7, `LIST_APPEND`
//! and `EXTENDED_ARG` move, 2.7 grows set/dict comprehension opcodes).
//! This crate therefore ships one read-only [`OpcodeTable`] per version:
//! mnemonics, the argument categories (`hasconst`, `hasname`, `hasjrel`,
//! ...), the categorical sets the scanner dispatches on, and the handful
//! of opcodes it needs by name.
//!
//! Membership queries are the hot path of bytecode analysis, so every
//! set is an [`OpSet`], a 256-bit bitmap indexed by the opcode byte.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod opset;
mod table;
mod versions;

pub use opset::OpSet;
pub use table::OpcodeTable;
pub use versions::PyVersion;
