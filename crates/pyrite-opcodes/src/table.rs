//! The per-version instruction-set description.

use crate::{OpSet, PyVersion};

/// Read-only description of one CPython 2.x instruction set.
///
/// Consumers treat this as data: every dispatch in the scanner keys off
/// a category set or one of the symbolic opcode fields rather than a
/// literal opcode number, because the numbers move between versions.
pub struct OpcodeTable {
    /// The bytecode version this table describes.
    pub version: PyVersion,
    pub(crate) names: [Option<&'static str>; 256],

    /// First opcode number that takes a 16-bit inline argument.
    pub have_argument: u8,
    /// Opcodes below [`have_argument`](Self::have_argument) that still
    /// take an argument. Empty for every 2.x version; kept so decoders
    /// do not bake the assumption in.
    pub has_argument_extended: OpSet,

    /// Argument indexes the constant pool.
    pub hasconst: OpSet,
    /// Argument indexes `co_names`.
    pub hasname: OpSet,
    /// Argument is a jump relative to the following instruction.
    pub hasjrel: OpSet,
    /// Argument is an absolute jump target.
    pub hasjabs: OpSet,
    /// Argument indexes `co_varnames`.
    pub haslocal: OpSet,
    /// Argument indexes the comparison-operator list.
    pub hascompare: OpSet,
    /// Argument indexes `co_cellvars ++ co_freevars`.
    pub hasfree: OpSet,
    /// All jump opcodes (`hasjrel` union `hasjabs`).
    pub jump_ops: OpSet,

    /// Opcodes that may begin a statement.
    pub stmt_opcodes: OpSet,
    /// Opcodes forming the left-hand side of an assignment.
    pub designator_ops: OpSet,
    /// Opcodes whose argument is a count appended to the emitted name.
    pub varargs_ops: OpSet,
    /// Block-setup opcodes (`SETUP_LOOP`, `SETUP_EXCEPT`, `SETUP_FINALLY`).
    pub setup_ops: OpSet,
    /// The 2.7 `JUMP_IF_FALSE_OR_POP`/`JUMP_IF_TRUE_OR_POP` pair.
    /// Empty before 2.7.
    pub pop_jump_if_or_pop: OpSet,

    /// Comparison operator names, indexed by the `COMPARE_OP` argument.
    pub cmp_op: &'static [&'static str],

    // Symbolic opcodes. Grouped here rather than exported as constants
    // because several of them change number across versions.
    /// Conditional jump taken when the test is false
    /// (`JUMP_IF_FALSE` through 2.6, `POP_JUMP_IF_FALSE` on 2.7).
    pub pjif: u8,
    /// Conditional jump taken when the test is true.
    pub pjit: u8,
    /// `JUMP_ABSOLUTE`.
    pub ja: u8,
    /// `JUMP_FORWARD`.
    pub jf: u8,
    /// `SETUP_LOOP`.
    pub setup_loop: u8,
    /// `SETUP_EXCEPT`.
    pub setup_except: u8,
    /// `SETUP_FINALLY`.
    pub setup_finally: u8,
    /// `END_FINALLY`.
    pub end_finally: u8,
    /// `POP_BLOCK`.
    pub pop_block: u8,
    /// `POP_TOP`.
    pub pop_top: u8,
    /// `DUP_TOP`.
    pub dup_top: u8,
    /// `ROT_TWO`.
    pub rot_two: u8,
    /// `FOR_ITER`.
    pub for_iter: u8,
    /// `GET_ITER`.
    pub get_iter: u8,
    /// `LIST_APPEND` (18 through 2.6, 94 on 2.7).
    pub list_append: u8,
    /// `LOAD_CONST`.
    pub load_const: u8,
    /// `LOAD_GLOBAL`.
    pub load_global: u8,
    /// `LOAD_CLOSURE`.
    pub load_closure: u8,
    /// `BUILD_TUPLE`.
    pub build_tuple: u8,
    /// `BUILD_SLICE`.
    pub build_slice: u8,
    /// `PRINT_ITEM`.
    pub print_item: u8,
    /// `PRINT_NEWLINE`.
    pub print_newline: u8,
    /// `IMPORT_NAME`.
    pub import_name: u8,
    /// `IMPORT_FROM`.
    pub import_from: u8,
    /// `IMPORT_STAR`.
    pub import_star: u8,
    /// `RETURN_VALUE`.
    pub return_value: u8,
    /// `RAISE_VARARGS`.
    pub raise_varargs: u8,
    /// `EXTENDED_ARG` (143 through 2.6, 145 on 2.7).
    pub extended_arg: u8,
}

impl OpcodeTable {
    /// Mnemonic of `op`, if the number is assigned in this version.
    pub fn name(&self, op: u8) -> Option<&'static str> {
        self.names[op as usize]
    }

    /// Reverse lookup: opcode number for a mnemonic.
    pub fn opcode(&self, name: &str) -> Option<u8> {
        self.names
            .iter()
            .position(|n| *n == Some(name))
            .map(|op| op as u8)
    }

    /// Does `op` carry a 16-bit inline argument?
    pub fn has_argument(&self, op: u8) -> bool {
        op >= self.have_argument || self.has_argument_extended.contains(op)
    }

    /// Comparison operator name for a `COMPARE_OP` argument.
    pub fn cmp_name(&self, arg: usize) -> Option<&'static str> {
        self.cmp_op.get(arg).copied()
    }

    /// Is `op` any jump, relative or absolute?
    pub fn is_jump(&self, op: u8) -> bool {
        self.jump_ops.contains(op)
    }
}
