//! Token scanner for CPython 2.5-2.7 bytecode.
//!
//! This crate is the front end of a decompiler. It takes a code object
//! (byte array plus its constant/name pools and line-number program),
//! recovers the block structure that the compiler flattened into a jump
//! graph, and emits a token stream a context-free deparsing grammar can
//! parse:
//!
//! - synthetic `COME_FROM` tokens mark every discovered jump target, so
//!   the grammar can match control-flow joins;
//! - opcodes are renamed where the raw mnemonic is ambiguous
//!   (`JUMP_ABSOLUTE` becomes `CONTINUE` or `JUMP_BACK`, `LOAD_GLOBAL`
//!   of the assertion error becomes `LOAD_ASSERT`, `LOAD_CONST` of a
//!   nested code object becomes `LOAD_LAMBDA`/`LOAD_GENEXPR`/...);
//! - variable-argument opcodes get their arity appended
//!   (`CALL_FUNCTION_3`), collected in a `customize` table.
//!
//! Nested code objects are not scanned recursively: they ride along as
//! token arguments and the caller decides whether to descend.
//!
//! # Example
//!
//! ```rust,ignore
//! use pyrite_scan::{disassemble, CodeBuilder, Const, PyVersion};
//!
//! let mut b = CodeBuilder::new(PyVersion::V27, "<module>");
//! b.line(1);
//! b.load_const(Const::Int(42));
//! b.store_name("x");
//! b.load_const(Const::None);
//! b.emit(b.op("RETURN_VALUE"));
//! let co = b.build();
//!
//! let dis = disassemble(PyVersion::V27, &co)?;
//! for token in &dis.tokens {
//!     println!("{token}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod code;
pub mod scan;
pub mod token;

pub use builder::{CodeBuilder, Label};
pub use code::{CodeObject, Const};
pub use pyrite_opcodes::PyVersion;
pub use scan::{disassemble, Block, BlockKind, Disassembly, ScanError, Scanner};
pub use token::{Token, TokenArg, TokenOffset};
