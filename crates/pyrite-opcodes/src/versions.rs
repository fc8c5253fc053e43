//! Table construction for each supported bytecode version.
//!
//! The 2.x instruction sets share a large common core; the builders
//! start from that core and apply the per-version deltas, the same way
//! CPython's own `opcode.py` derives one version from the next.

use std::fmt;

use once_cell::sync::Lazy;

use crate::{OpSet, OpcodeTable};

/// Bytecode version understood by the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PyVersion {
    /// CPython 2.5
    V25,
    /// CPython 2.6
    V26,
    /// CPython 2.7
    V27,
}

impl PyVersion {
    /// Dotted form, e.g. `"2.7"`.
    pub fn as_str(self) -> &'static str {
        match self {
            PyVersion::V25 => "2.5",
            PyVersion::V26 => "2.6",
            PyVersion::V27 => "2.7",
        }
    }
}

impl fmt::Display for PyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static TABLE_25: Lazy<OpcodeTable> = Lazy::new(|| build(PyVersion::V25));
static TABLE_26: Lazy<OpcodeTable> = Lazy::new(|| build(PyVersion::V26));
static TABLE_27: Lazy<OpcodeTable> = Lazy::new(|| build(PyVersion::V27));

impl OpcodeTable {
    /// The table for a bytecode version. Tables are built once per
    /// process and shared.
    pub fn for_version(version: PyVersion) -> &'static OpcodeTable {
        match version {
            PyVersion::V25 => &TABLE_25,
            PyVersion::V26 => &TABLE_26,
            PyVersion::V27 => &TABLE_27,
        }
    }
}

const CMP_OP: &[&str] = &[
    "<",
    "<=",
    "==",
    "!=",
    ">",
    ">=",
    "in",
    "not in",
    "is",
    "is not",
    "exception match",
    "BAD",
];

fn def_op(t: &mut OpcodeTable, name: &'static str, op: u8) {
    t.names[op as usize] = Some(name);
}

fn name_op(t: &mut OpcodeTable, name: &'static str, op: u8) {
    def_op(t, name, op);
    t.hasname.insert(op);
}

fn jrel_op(t: &mut OpcodeTable, name: &'static str, op: u8) {
    def_op(t, name, op);
    t.hasjrel.insert(op);
}

fn jabs_op(t: &mut OpcodeTable, name: &'static str, op: u8) {
    def_op(t, name, op);
    t.hasjabs.insert(op);
}

fn const_op(t: &mut OpcodeTable, name: &'static str, op: u8) {
    def_op(t, name, op);
    t.hasconst.insert(op);
}

fn local_op(t: &mut OpcodeTable, name: &'static str, op: u8) {
    def_op(t, name, op);
    t.haslocal.insert(op);
}

fn free_op(t: &mut OpcodeTable, name: &'static str, op: u8) {
    def_op(t, name, op);
    t.hasfree.insert(op);
}

fn compare_op(t: &mut OpcodeTable, name: &'static str, op: u8) {
    def_op(t, name, op);
    t.hascompare.insert(op);
}

/// Fill in the instruction core shared by every 2.x version.
fn fill_base(t: &mut OpcodeTable) {
    def_op(t, "STOP_CODE", 0);
    def_op(t, "POP_TOP", 1);
    def_op(t, "ROT_TWO", 2);
    def_op(t, "ROT_THREE", 3);
    def_op(t, "DUP_TOP", 4);
    def_op(t, "ROT_FOUR", 5);
    def_op(t, "NOP", 9);
    def_op(t, "UNARY_POSITIVE", 10);
    def_op(t, "UNARY_NEGATIVE", 11);
    def_op(t, "UNARY_NOT", 12);
    def_op(t, "UNARY_CONVERT", 13);
    def_op(t, "UNARY_INVERT", 15);
    def_op(t, "BINARY_POWER", 19);
    def_op(t, "BINARY_MULTIPLY", 20);
    def_op(t, "BINARY_DIVIDE", 21);
    def_op(t, "BINARY_MODULO", 22);
    def_op(t, "BINARY_ADD", 23);
    def_op(t, "BINARY_SUBTRACT", 24);
    def_op(t, "BINARY_SUBSCR", 25);
    def_op(t, "BINARY_FLOOR_DIVIDE", 26);
    def_op(t, "BINARY_TRUE_DIVIDE", 27);
    def_op(t, "INPLACE_FLOOR_DIVIDE", 28);
    def_op(t, "INPLACE_TRUE_DIVIDE", 29);
    def_op(t, "SLICE+0", 30);
    def_op(t, "SLICE+1", 31);
    def_op(t, "SLICE+2", 32);
    def_op(t, "SLICE+3", 33);
    def_op(t, "STORE_SLICE+0", 40);
    def_op(t, "STORE_SLICE+1", 41);
    def_op(t, "STORE_SLICE+2", 42);
    def_op(t, "STORE_SLICE+3", 43);
    def_op(t, "DELETE_SLICE+0", 50);
    def_op(t, "DELETE_SLICE+1", 51);
    def_op(t, "DELETE_SLICE+2", 52);
    def_op(t, "DELETE_SLICE+3", 53);
    def_op(t, "INPLACE_ADD", 55);
    def_op(t, "INPLACE_SUBTRACT", 56);
    def_op(t, "INPLACE_MULTIPLY", 57);
    def_op(t, "INPLACE_DIVIDE", 58);
    def_op(t, "INPLACE_MODULO", 59);
    def_op(t, "STORE_SUBSCR", 60);
    def_op(t, "DELETE_SUBSCR", 61);
    def_op(t, "BINARY_LSHIFT", 62);
    def_op(t, "BINARY_RSHIFT", 63);
    def_op(t, "BINARY_AND", 64);
    def_op(t, "BINARY_XOR", 65);
    def_op(t, "BINARY_OR", 66);
    def_op(t, "INPLACE_POWER", 67);
    def_op(t, "GET_ITER", 68);
    def_op(t, "PRINT_EXPR", 70);
    def_op(t, "PRINT_ITEM", 71);
    def_op(t, "PRINT_NEWLINE", 72);
    def_op(t, "PRINT_ITEM_TO", 73);
    def_op(t, "PRINT_NEWLINE_TO", 74);
    def_op(t, "INPLACE_LSHIFT", 75);
    def_op(t, "INPLACE_RSHIFT", 76);
    def_op(t, "INPLACE_AND", 77);
    def_op(t, "INPLACE_XOR", 78);
    def_op(t, "INPLACE_OR", 79);
    def_op(t, "BREAK_LOOP", 80);
    def_op(t, "WITH_CLEANUP", 81);
    def_op(t, "LOAD_LOCALS", 82);
    def_op(t, "RETURN_VALUE", 83);
    def_op(t, "IMPORT_STAR", 84);
    def_op(t, "EXEC_STMT", 85);
    def_op(t, "YIELD_VALUE", 86);
    def_op(t, "POP_BLOCK", 87);
    def_op(t, "END_FINALLY", 88);
    def_op(t, "BUILD_CLASS", 89);

    // Everything from here on carries a 16-bit argument.
    name_op(t, "STORE_NAME", 90);
    name_op(t, "DELETE_NAME", 91);
    def_op(t, "UNPACK_SEQUENCE", 92);
    jrel_op(t, "FOR_ITER", 93);
    name_op(t, "STORE_ATTR", 95);
    name_op(t, "DELETE_ATTR", 96);
    name_op(t, "STORE_GLOBAL", 97);
    name_op(t, "DELETE_GLOBAL", 98);
    def_op(t, "DUP_TOPX", 99);
    const_op(t, "LOAD_CONST", 100);
    name_op(t, "LOAD_NAME", 101);
    def_op(t, "BUILD_TUPLE", 102);
    def_op(t, "BUILD_LIST", 103);
    def_op(t, "BUILD_MAP", 105);
    name_op(t, "LOAD_ATTR", 106);
    compare_op(t, "COMPARE_OP", 107);
    name_op(t, "IMPORT_NAME", 108);
    name_op(t, "IMPORT_FROM", 109);
    jrel_op(t, "JUMP_FORWARD", 110);
    jabs_op(t, "JUMP_ABSOLUTE", 113);
    name_op(t, "LOAD_GLOBAL", 116);
    jabs_op(t, "CONTINUE_LOOP", 119);
    jrel_op(t, "SETUP_LOOP", 120);
    jrel_op(t, "SETUP_EXCEPT", 121);
    jrel_op(t, "SETUP_FINALLY", 122);
    local_op(t, "LOAD_FAST", 124);
    local_op(t, "STORE_FAST", 125);
    local_op(t, "DELETE_FAST", 126);
    def_op(t, "RAISE_VARARGS", 130);
    def_op(t, "CALL_FUNCTION", 131);
    def_op(t, "MAKE_FUNCTION", 132);
    def_op(t, "BUILD_SLICE", 133);
    def_op(t, "MAKE_CLOSURE", 134);
    free_op(t, "LOAD_CLOSURE", 135);
    free_op(t, "LOAD_DEREF", 136);
    free_op(t, "STORE_DEREF", 137);
    def_op(t, "CALL_FUNCTION_VAR", 140);
    def_op(t, "CALL_FUNCTION_KW", 141);
    def_op(t, "CALL_FUNCTION_VAR_KW", 142);
}

fn build(version: PyVersion) -> OpcodeTable {
    let mut t = OpcodeTable {
        version,
        names: [None; 256],
        have_argument: 90,
        has_argument_extended: OpSet::new(),
        hasconst: OpSet::new(),
        hasname: OpSet::new(),
        hasjrel: OpSet::new(),
        hasjabs: OpSet::new(),
        haslocal: OpSet::new(),
        hascompare: OpSet::new(),
        hasfree: OpSet::new(),
        jump_ops: OpSet::new(),
        stmt_opcodes: OpSet::new(),
        designator_ops: OpSet::new(),
        varargs_ops: OpSet::new(),
        setup_ops: OpSet::new(),
        pop_jump_if_or_pop: OpSet::new(),
        cmp_op: CMP_OP,
        pjif: 0,
        pjit: 0,
        ja: 113,
        jf: 110,
        setup_loop: 120,
        setup_except: 121,
        setup_finally: 122,
        end_finally: 88,
        pop_block: 87,
        pop_top: 1,
        dup_top: 4,
        rot_two: 2,
        for_iter: 93,
        get_iter: 68,
        list_append: 0,
        load_const: 100,
        load_global: 116,
        load_closure: 135,
        build_tuple: 102,
        build_slice: 133,
        print_item: 71,
        print_newline: 72,
        import_name: 108,
        import_from: 109,
        import_star: 84,
        return_value: 83,
        raise_varargs: 130,
        extended_arg: 0,
    };
    fill_base(&mut t);

    match version {
        PyVersion::V25 | PyVersion::V26 => {
            def_op(&mut t, "LIST_APPEND", 18);
            jrel_op(&mut t, "JUMP_IF_FALSE", 111);
            jrel_op(&mut t, "JUMP_IF_TRUE", 112);
            def_op(&mut t, "EXTENDED_ARG", 143);
            t.list_append = 18;
            t.pjif = 111;
            t.pjit = 112;
            t.extended_arg = 143;
            if version == PyVersion::V26 {
                def_op(&mut t, "STORE_MAP", 54);
            }
        }
        PyVersion::V27 => {
            def_op(&mut t, "STORE_MAP", 54);
            def_op(&mut t, "LIST_APPEND", 94);
            def_op(&mut t, "BUILD_SET", 104);
            jabs_op(&mut t, "JUMP_IF_FALSE_OR_POP", 111);
            jabs_op(&mut t, "JUMP_IF_TRUE_OR_POP", 112);
            jabs_op(&mut t, "POP_JUMP_IF_FALSE", 114);
            jabs_op(&mut t, "POP_JUMP_IF_TRUE", 115);
            jrel_op(&mut t, "SETUP_WITH", 143);
            def_op(&mut t, "EXTENDED_ARG", 145);
            def_op(&mut t, "SET_ADD", 146);
            def_op(&mut t, "MAP_ADD", 147);
            t.list_append = 94;
            t.pjif = 114;
            t.pjit = 115;
            t.extended_arg = 145;
            t.pop_jump_if_or_pop = OpSet::of(&[111, 112]);
        }
    }

    t.jump_ops = t.hasjrel.union(t.hasjabs);

    t.stmt_opcodes = OpSet::of(&[
        t.setup_loop,
        80, // BREAK_LOOP
        t.setup_finally,
        t.end_finally,
        t.setup_except,
        t.pop_block,
        125, // STORE_FAST
        126, // DELETE_FAST
        137, // STORE_DEREF
        97,  // STORE_GLOBAL
        98,  // DELETE_GLOBAL
        90,  // STORE_NAME
        91,  // DELETE_NAME
        95,  // STORE_ATTR
        96,  // DELETE_ATTR
        60,  // STORE_SUBSCR
        61,  // DELETE_SUBSCR
        t.return_value,
        t.raise_varargs,
        t.pop_top,
        70, // PRINT_EXPR
        t.print_item,
        t.print_newline,
        73,  // PRINT_ITEM_TO
        74,  // PRINT_NEWLINE_TO
        119, // CONTINUE_LOOP
        t.ja,
        85, // EXEC_STMT
    ]);

    t.designator_ops = OpSet::of(&[
        125, // STORE_FAST
        90,  // STORE_NAME
        97,  // STORE_GLOBAL
        137, // STORE_DEREF
        95,  // STORE_ATTR
        40,  // STORE_SLICE+0
        41,  // STORE_SLICE+1
        42,  // STORE_SLICE+2
        43,  // STORE_SLICE+3
        60,  // STORE_SUBSCR
        92,  // UNPACK_SEQUENCE
        t.ja,
    ]);

    t.varargs_ops = OpSet::of(&[
        103, // BUILD_LIST
        t.build_tuple,
        t.build_slice,
        92,  // UNPACK_SEQUENCE
        132, // MAKE_FUNCTION
        131, // CALL_FUNCTION
        134, // MAKE_CLOSURE
        140, // CALL_FUNCTION_VAR
        141, // CALL_FUNCTION_KW
        142, // CALL_FUNCTION_VAR_KW
        99,  // DUP_TOPX
        t.raise_varargs,
    ]);
    if version == PyVersion::V27 {
        t.varargs_ops.insert(104); // BUILD_SET
    }

    t.setup_ops = OpSet::of(&[t.setup_loop, t.setup_except, t.setup_finally]);

    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_jumps_moved_in_27() {
        let t26 = OpcodeTable::for_version(PyVersion::V26);
        assert_eq!(t26.name(t26.pjif), Some("JUMP_IF_FALSE"));
        assert!(t26.hasjrel.contains(t26.pjif));
        assert!(t26.pop_jump_if_or_pop.is_empty());

        let t27 = OpcodeTable::for_version(PyVersion::V27);
        assert_eq!(t27.name(t27.pjif), Some("POP_JUMP_IF_FALSE"));
        assert!(t27.hasjabs.contains(t27.pjif));
        assert_eq!(t27.pop_jump_if_or_pop.len(), 2);
        assert!(t27.pop_jump_if_or_pop.contains(111));
        assert!(t27.pop_jump_if_or_pop.contains(112));
    }

    #[test]
    fn test_moved_opcodes() {
        let t25 = OpcodeTable::for_version(PyVersion::V25);
        let t27 = OpcodeTable::for_version(PyVersion::V27);
        assert_eq!(t25.list_append, 18);
        assert_eq!(t27.list_append, 94);
        assert_eq!(t25.extended_arg, 143);
        assert_eq!(t27.extended_arg, 145);
        assert_eq!(t27.name(143), Some("SETUP_WITH"));
        assert_eq!(t25.name(54), None);
        assert_eq!(OpcodeTable::for_version(PyVersion::V26).name(54), Some("STORE_MAP"));
    }

    #[test]
    fn test_argument_threshold() {
        let t = OpcodeTable::for_version(PyVersion::V27);
        assert!(!t.has_argument(t.pop_top));
        assert!(!t.has_argument(t.return_value));
        assert!(t.has_argument(t.load_const));
        assert!(t.has_argument(t.ja));
        assert_eq!(t.have_argument, 90);
    }

    #[test]
    fn test_category_membership() {
        let t = OpcodeTable::for_version(PyVersion::V27);
        assert!(t.hasconst.contains(t.load_const));
        assert!(t.hasname.contains(t.load_global));
        assert!(t.hasjrel.contains(t.jf));
        assert!(t.hasjabs.contains(t.ja));
        assert!(t.hascompare.contains(107));
        assert!(t.hasfree.contains(t.load_closure));
        assert!(t.is_jump(t.for_iter));
        assert_eq!(t.cmp_name(10), Some("exception match"));
    }

    #[test]
    fn test_categorical_sets() {
        let t = OpcodeTable::for_version(PyVersion::V27);
        assert!(t.stmt_opcodes.contains(t.setup_loop));
        assert!(t.stmt_opcodes.contains(t.ja));
        assert!(!t.stmt_opcodes.contains(t.jf));
        assert!(t.designator_ops.contains(92));
        assert!(t.varargs_ops.contains(131));
        assert!(t.varargs_ops.contains(104));
        assert!(!OpcodeTable::for_version(PyVersion::V26).varargs_ops.contains(104));
        assert_eq!(t.setup_ops.len(), 3);
    }

    #[test]
    fn test_reverse_lookup() {
        let t = OpcodeTable::for_version(PyVersion::V27);
        assert_eq!(t.opcode("LOAD_CONST"), Some(100));
        assert_eq!(t.opcode("POP_JUMP_IF_TRUE"), Some(115));
        assert_eq!(t.opcode("SPAM"), None);
    }
}
