//! The scanner core: truncation, line/statement analysis, structure
//! recovery, and token emission.
//!
//! A [`Scanner`] is built once per bytecode version and may be reused;
//! every [`disassemble`](Scanner::disassemble) call rebuilds the scratch
//! state from the given code object. The passes run strictly forward:
//!
//! 1. truncate the byte array after the last `RETURN_VALUE`/`END_FINALLY`;
//! 2. build the line map and the backward (`prev`) map;
//! 3. find statement boundaries;
//! 4. classify block structure and fix optimized jumps, collecting
//!    jump targets;
//! 5. emit renamed tokens with synthetic `COME_FROM` markers.

mod cursor;
mod emit;
mod lines;
mod stmts;
mod structure;

use log::debug;
use pyrite_opcodes::{OpSet, OpcodeTable, PyVersion};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::code::CodeObject;
use crate::token::Token;

use self::lines::LineEntry;
use self::structure::FixedJump;

pub use self::structure::{Block, BlockKind};

/// Errors that abort disassembly.
///
/// Everything else degrades instead of failing: jump targets outside
/// the truncated region are clamped to their enclosing block, and
/// opcodes with no table entry are emitted under a raw placeholder
/// name.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The byte array contains no `RETURN_VALUE` or `END_FINALLY`, so
    /// no truncation point exists.
    #[error("no RETURN_VALUE or END_FINALLY in {size} bytes of code")]
    MalformedBytecode {
        /// Length of the rejected byte array.
        size: usize,
    },
    /// On 2.7 the instruction before an except-chain `END_FINALLY`
    /// must be a forward jump or `RETURN_VALUE`.
    #[error("unexpected {opname} before END_FINALLY at offset {offset}")]
    UnexpectedExceptTail {
        /// Offset of the offending instruction.
        offset: usize,
        /// Its mnemonic.
        opname: String,
    },
}

/// Scanner output: the token stream plus the arity table.
#[derive(Debug, Default)]
pub struct Disassembly {
    /// Tokens in non-decreasing offset order; synthetic `COME_FROM`
    /// markers precede the real instruction at their offset.
    pub tokens: Vec<Token>,
    /// Emitted name to arity, for every variable-argument rename
    /// except `BUILD_SLICE`.
    pub customize: FxHashMap<String, u32>,
}

/// Version-specific behavior switches.
///
/// Only two places differ between 2.5/2.6 and 2.7; they are routed
/// through flags rather than separate scanner types.
#[derive(Debug, Clone, Copy)]
struct VersionCaps {
    /// 2.7 asserts the shape of the instruction before an except-chain
    /// `END_FINALLY`.
    strict_except_tail: bool,
    /// 2.7's absolute `JUMP_IF_*_OR_POP` participate in target
    /// collection.
    or_pop_targets: bool,
}

impl VersionCaps {
    fn of(version: PyVersion) -> Self {
        let v27 = version == PyVersion::V27;
        VersionCaps {
            strict_except_tail: v27,
            or_pop_targets: v27,
        }
    }
}

/// One-pass-per-code-object scanner for 2.x bytecode.
pub struct Scanner {
    version: PyVersion,
    caps: VersionCaps,
    opc: &'static OpcodeTable,
    /// `{PJIF, PJIT}` for this version.
    pop_jump_if: OpSet,
    /// The unconditional jumps `{JUMP_ABSOLUTE, JUMP_FORWARD}`.
    jump_forward: OpSet,

    // Scratch state, rebuilt per disassemble call.
    pub(crate) code: Vec<u8>,
    pub(crate) prev: Vec<usize>,
    pub(crate) lines: Vec<LineEntry>,
    pub(crate) linestart_offsets: FxHashMap<usize, u32>,
    pub(crate) names: Vec<String>,
    pub(crate) varnames: Vec<String>,
    pub(crate) free: Vec<String>,
    pub(crate) stmts: FxHashSet<usize>,
    pub(crate) stmt_list: Vec<usize>,
    pub(crate) next_stmt: Vec<usize>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) loops: Vec<usize>,
    pub(crate) fixed_jumps: FxHashMap<usize, FixedJump>,
    pub(crate) ignore_if: FxHashSet<usize>,
    pub(crate) not_continue: FxHashSet<usize>,
    pub(crate) return_end_ifs: FxHashSet<usize>,
    pub(crate) load_asserts: FxHashSet<usize>,
}

impl Scanner {
    /// A scanner for the given bytecode version.
    pub fn new(version: PyVersion) -> Self {
        let opc = OpcodeTable::for_version(version);
        Scanner {
            version,
            caps: VersionCaps::of(version),
            opc,
            pop_jump_if: OpSet::of(&[opc.pjif, opc.pjit]),
            jump_forward: OpSet::of(&[opc.ja, opc.jf]),
            code: Vec::new(),
            prev: Vec::new(),
            lines: Vec::new(),
            linestart_offsets: FxHashMap::default(),
            names: Vec::new(),
            varnames: Vec::new(),
            free: Vec::new(),
            stmts: FxHashSet::default(),
            stmt_list: Vec::new(),
            next_stmt: Vec::new(),
            blocks: Vec::new(),
            loops: Vec::new(),
            fixed_jumps: FxHashMap::default(),
            ignore_if: FxHashSet::default(),
            not_continue: FxHashSet::default(),
            return_end_ifs: FxHashSet::default(),
            load_asserts: FxHashSet::default(),
        }
    }

    /// The version this scanner decodes.
    pub fn version(&self) -> PyVersion {
        self.version
    }

    /// Scan `co` into an annotated token stream.
    ///
    /// When `classname` is given, private names mangled into that class
    /// (`_Class__name`) are restored to their source form (`__name`)
    /// in every name pool before resolution.
    pub fn disassemble(
        &mut self,
        co: &CodeObject,
        classname: Option<&str>,
    ) -> Result<Disassembly, ScanError> {
        self.reset();
        let n = self.setup_code(&co.code)?;
        self.build_lines_data(co, n);
        self.build_prev_map(n);
        self.resolve_names(co, classname);
        self.seed_load_asserts();
        let targets = self.find_jump_targets()?;
        debug!(
            "scanned {} ({}): {} bytes, {} statements, {} blocks, {} jump targets",
            co.name,
            self.version,
            n,
            self.stmt_list.len(),
            self.blocks.len(),
            targets.len()
        );
        Ok(self.emit_tokens(co, &targets))
    }

    fn reset(&mut self) {
        self.code.clear();
        self.prev.clear();
        self.lines.clear();
        self.linestart_offsets.clear();
        self.names.clear();
        self.varnames.clear();
        self.free.clear();
        self.stmts.clear();
        self.stmt_list.clear();
        self.next_stmt.clear();
        self.blocks.clear();
        self.loops.clear();
        self.fixed_jumps.clear();
        self.ignore_if.clear();
        self.not_continue.clear();
        self.return_end_ifs.clear();
        self.load_asserts.clear();
    }

    fn resolve_names(&mut self, co: &CodeObject, classname: Option<&str>) {
        let mut free: Vec<String> = co
            .cellvars
            .iter()
            .chain(co.freevars.iter())
            .cloned()
            .collect();
        let mut names = co.names.clone();
        let mut varnames = co.varnames.clone();
        if let Some(class) = classname {
            let prefix = format!("_{}__", class.trim_start_matches('_'));
            for pool in [&mut free, &mut names, &mut varnames] {
                for name in pool.iter_mut() {
                    *name = unmangle(name, &prefix);
                }
            }
        }
        self.free = free;
        self.names = names;
        self.varnames = varnames;
    }

    /// Record every `LOAD_GLOBAL AssertionError` directly following a
    /// true-branch test; the structural analyzer later strikes the ones
    /// that turn out not to be asserts.
    fn seed_load_asserts(&mut self) {
        let n = self.code.len();
        let offsets: Vec<usize> = self.op_range(0, n).collect();
        for i in offsets {
            if self.code[i] == self.opc.pjit
                && self.code.get(i + 3) == Some(&self.opc.load_global)
            {
                let idx = self.argument(i + 3);
                if self.names.get(idx).map(String::as_str) == Some("AssertionError") {
                    self.load_asserts.insert(i + 3);
                }
            }
        }
    }

    pub(crate) fn opname_string(&self, op: u8) -> String {
        match self.opc.name(op) {
            Some(name) => name.to_string(),
            None => format!("<{op}>"),
        }
    }
}

/// Strip a class-private mangling prefix, keeping the two leading
/// underscores of the source name.
fn unmangle(name: &str, prefix: &str) -> String {
    if name.starts_with(prefix) && !name.ends_with("__") {
        name[prefix.len() - 2..].to_string()
    } else {
        name.to_string()
    }
}

/// Scan a code object with a throwaway [`Scanner`].
pub fn disassemble(version: PyVersion, co: &CodeObject) -> Result<Disassembly, ScanError> {
    Scanner::new(version).disassemble(co, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmangle() {
        assert_eq!(unmangle("_Klass__secret", "_Klass__"), "__secret");
        assert_eq!(unmangle("_Klass__dunder__", "_Klass__"), "_Klass__dunder__");
        assert_eq!(unmangle("plain", "_Klass__"), "plain");
    }
}
