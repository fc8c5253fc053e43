//! A small two-pass assembler for fabricating 2.x code objects.
//!
//! Laying out test bytecode by hand means recomputing every jump operand
//! each time an instruction is inserted. `CodeBuilder` does the second
//! pass instead: jumps reference labels, line starts are recorded as
//! marks and packed into `co_lnotab`, and constants and names are
//! interned on first use.
//!
//! This is fixture tooling: misuse (an unmarked label, an unknown
//! mnemonic, a backward relative jump) panics rather than returning an
//! error.

use pyrite_opcodes::{OpcodeTable, PyVersion};

use crate::code::{CodeObject, Const};

/// A forward-patchable jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Incremental builder for a [`CodeObject`].
pub struct CodeBuilder {
    opc: &'static OpcodeTable,
    name: String,
    filename: String,
    code: Vec<u8>,
    consts: Vec<Const>,
    names: Vec<String>,
    varnames: Vec<String>,
    cellvars: Vec<String>,
    freevars: Vec<String>,
    line_marks: Vec<(usize, u32)>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, u8, Label)>,
}

impl CodeBuilder {
    /// Start a code object named `name` for the given bytecode version.
    pub fn new(version: PyVersion, name: &str) -> Self {
        CodeBuilder {
            opc: OpcodeTable::for_version(version),
            name: name.to_string(),
            filename: "<synthetic>".to_string(),
            code: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            line_marks: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Opcode number for a mnemonic in this builder's version.
    ///
    /// Panics on an unknown mnemonic.
    pub fn op(&self, name: &str) -> u8 {
        match self.opc.opcode(name) {
            Some(op) => op,
            None => panic!("unknown opcode mnemonic {name:?} for {}", self.opc.version),
        }
    }

    /// Current byte offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Record that source line `line_no` starts at the current offset.
    pub fn line(&mut self, line_no: u32) {
        self.line_marks.push((self.code.len(), line_no));
    }

    /// Allocate an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset.
    pub fn mark(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    /// Emit an argument-less instruction.
    pub fn emit(&mut self, op: u8) {
        self.code.push(op);
    }

    /// Emit an instruction with an explicit 16-bit argument.
    pub fn emit_arg(&mut self, op: u8, arg: u16) {
        self.code.push(op);
        self.code.extend_from_slice(&arg.to_le_bytes());
    }

    /// Emit a jump to `label`; the operand is patched at build time,
    /// relative or absolute according to the opcode's category.
    pub fn emit_jump(&mut self, op: u8, label: Label) {
        let site = self.code.len();
        self.emit_arg(op, 0);
        self.fixups.push((site, op, label));
    }

    /// Intern a constant, returning its pool index.
    pub fn const_idx(&mut self, value: Const) -> u16 {
        if let Some(i) = self.consts.iter().position(|c| *c == value) {
            return i as u16;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u16
    }

    /// Intern a name, returning its `co_names` index.
    pub fn name_idx(&mut self, name: &str) -> u16 {
        intern(&mut self.names, name)
    }

    /// Intern a local variable name, returning its `co_varnames` index.
    pub fn varname_idx(&mut self, name: &str) -> u16 {
        intern(&mut self.varnames, name)
    }

    /// Intern a cell variable name, returning its `co_cellvars` index.
    pub fn cellvar_idx(&mut self, name: &str) -> u16 {
        intern(&mut self.cellvars, name)
    }

    /// `LOAD_CONST value`.
    pub fn load_const(&mut self, value: Const) {
        let idx = self.const_idx(value);
        self.emit_arg(self.opc.load_const, idx);
    }

    /// `LOAD_NAME name`.
    pub fn load_name(&mut self, name: &str) {
        let op = self.op("LOAD_NAME");
        let idx = self.name_idx(name);
        self.emit_arg(op, idx);
    }

    /// `STORE_NAME name`.
    pub fn store_name(&mut self, name: &str) {
        let op = self.op("STORE_NAME");
        let idx = self.name_idx(name);
        self.emit_arg(op, idx);
    }

    /// `LOAD_GLOBAL name`.
    pub fn load_global(&mut self, name: &str) {
        let idx = self.name_idx(name);
        self.emit_arg(self.opc.load_global, idx);
    }

    /// `LOAD_FAST name`.
    pub fn load_fast(&mut self, name: &str) {
        let op = self.op("LOAD_FAST");
        let idx = self.varname_idx(name);
        self.emit_arg(op, idx);
    }

    /// `LOAD_CONST None; RETURN_VALUE`, the standard epilogue.
    pub fn return_none(&mut self) {
        self.load_const(Const::None);
        self.emit(self.opc.return_value);
    }

    /// Resolve all jumps, pack the line table, and produce the code
    /// object.
    ///
    /// Panics if a jump label was never marked or a relative jump would
    /// need a negative operand.
    pub fn build(self) -> CodeObject {
        let CodeBuilder {
            opc,
            name,
            filename,
            mut code,
            consts,
            names,
            varnames,
            cellvars,
            freevars,
            line_marks,
            labels,
            fixups,
        } = self;
        for (site, op, label) in fixups {
            let target = match labels[label.0] {
                Some(t) => t,
                None => panic!("jump at offset {site} references an unmarked label"),
            };
            let arg = if opc.hasjrel.contains(op) {
                match target.checked_sub(site + 3) {
                    Some(rel) => rel,
                    None => panic!("relative jump at {site} targets earlier offset {target}"),
                }
            } else {
                target
            };
            let bytes = (arg as u16).to_le_bytes();
            code[site + 1] = bytes[0];
            code[site + 2] = bytes[1];
        }
        let first_line = line_marks.first().map(|&(_, l)| l).unwrap_or(1);
        let lnotab = encode_lnotab(&line_marks, first_line);
        CodeObject {
            name,
            filename,
            first_line,
            code,
            consts,
            names,
            varnames,
            cellvars,
            freevars,
            lnotab,
        }
    }
}

fn intern(pool: &mut Vec<String>, name: &str) -> u16 {
    if let Some(i) = pool.iter().position(|n| n == name) {
        return i as u16;
    }
    pool.push(name.to_string());
    (pool.len() - 1) as u16
}

/// Pack `(offset, line)` marks into `co_lnotab` delta pairs, splitting
/// deltas over 255 the way the 2.x compiler does.
fn encode_lnotab(marks: &[(usize, u32)], first_line: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let (mut prev_off, mut prev_line) = (0usize, first_line);
    for &(off, line) in marks {
        let mut d_off = off.saturating_sub(prev_off);
        let mut d_line = line.saturating_sub(prev_line);
        while d_off > 255 {
            out.push(255);
            out.push(0);
            d_off -= 255;
        }
        while d_line > 255 {
            out.push(d_off as u8);
            out.push(255);
            d_off = 0;
            d_line -= 255;
        }
        out.push(d_off as u8);
        out.push(d_line as u8);
        prev_off = off;
        prev_line = line;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_jump_patched() {
        let mut b = CodeBuilder::new(PyVersion::V27, "<module>");
        let done = b.label();
        b.emit_jump(b.op("JUMP_FORWARD"), done);
        b.emit(b.op("POP_TOP"));
        b.mark(done);
        b.return_none();
        let co = b.build();
        // JUMP_FORWARD at 0 is relative: target 4, operand 4 - 3 = 1
        assert_eq!(co.code[0], 110);
        assert_eq!(co.code[1], 1);
        assert_eq!(co.code[2], 0);
    }

    #[test]
    fn test_backward_absolute_jump() {
        let mut b = CodeBuilder::new(PyVersion::V27, "<module>");
        let top = b.label();
        b.mark(top);
        b.emit(b.op("NOP"));
        b.emit_jump(b.op("JUMP_ABSOLUTE"), top);
        b.return_none();
        let co = b.build();
        assert_eq!(co.code[1], 113);
        assert_eq!(co.code[2], 0);
        assert_eq!(co.code[3], 0);
    }

    #[test]
    fn test_pools_are_interned() {
        let mut b = CodeBuilder::new(PyVersion::V27, "<module>");
        b.load_name("x");
        b.load_name("x");
        b.store_name("y");
        b.load_const(Const::Int(1));
        b.load_const(Const::Int(1));
        let co = b.build();
        assert_eq!(co.names, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(co.consts.len(), 1);
    }

    #[test]
    fn test_lnotab_round_trip() {
        let mut b = CodeBuilder::new(PyVersion::V27, "<module>");
        b.line(1);
        b.load_const(Const::Int(1));
        b.store_name("x");
        b.line(2);
        b.load_const(Const::Int(2));
        b.store_name("y");
        b.line(5);
        b.return_none();
        let co = b.build();
        assert_eq!(co.first_line, 1);
        assert_eq!(co.line_starts(), vec![(0, 1), (6, 2), (12, 5)]);
    }

    #[test]
    #[should_panic(expected = "unmarked label")]
    fn test_unmarked_label_panics() {
        let mut b = CodeBuilder::new(PyVersion::V27, "<module>");
        let never = b.label();
        b.emit_jump(b.op("JUMP_FORWARD"), never);
        b.build();
    }
}
