//! Second linear pass: emit renamed tokens and synthetic markers.

use std::sync::Arc;

use log::trace;
use rustc_hash::FxHashMap;

use crate::code::{CodeObject, Const};
use crate::token::{Token, TokenArg, TokenOffset};

use super::{Disassembly, Scanner};

impl Scanner {
    /// Walk the truncated code in offset order, emitting one token per
    /// instruction plus a `COME_FROM` marker per collected jump source,
    /// and recording arities of variable-argument opcodes.
    pub(crate) fn emit_tokens(
        &self,
        co: &CodeObject,
        targets: &FxHashMap<usize, Vec<usize>>,
    ) -> Disassembly {
        let opc = self.opc;
        let n = self.code.len();
        let replace = self.continuation_replacements();

        let mut tokens = Vec::new();
        let mut customize = FxHashMap::default();
        let mut extended_arg = 0usize;
        let mut i = 0usize;
        while i < n {
            if let Some(sources) = targets.get(&i) {
                for (index, &source) in sources.iter().enumerate() {
                    tokens.push(Token {
                        kind: "COME_FROM".to_string(),
                        arg: None,
                        pattr: Some(source.to_string()),
                        offset: TokenOffset::Synthetic { at: i, index },
                        line_start: None,
                    });
                }
            }

            let op = self.code[i];
            let size = self.op_size(op);
            let mut kind = self.opname_string(op);
            let mut arg = None;
            let mut pattr = None;
            let mut oparg = 0usize;

            if opc.has_argument(op) {
                oparg = self.argument(i) + extended_arg;
                extended_arg = 0;
                if op == opc.extended_arg {
                    extended_arg = oparg * 65536;
                    i += size;
                    continue;
                }
                arg = Some(TokenArg::Arg(oparg));
                if opc.hasconst.contains(op) {
                    match co.consts.get(oparg) {
                        Some(Const::Code(code)) => {
                            arg = Some(TokenArg::Code(Arc::clone(code)));
                            kind = match code.name.as_str() {
                                "<lambda>" => "LOAD_LAMBDA".to_string(),
                                "<genexpr>" => "LOAD_GENEXPR".to_string(),
                                "<dictcomp>" => "LOAD_DICTCOMP".to_string(),
                                "<setcomp>" => "LOAD_SETCOMP".to_string(),
                                _ => kind,
                            };
                            pattr = Some(format!("<code_object {}>", code.name));
                        }
                        Some(constant) => pattr = Some(constant.to_string()),
                        None => {}
                    }
                } else if opc.hasname.contains(op) {
                    pattr = self.names.get(oparg).cloned();
                } else if opc.hasjrel.contains(op) {
                    pattr = Some((i + 3 + oparg).to_string());
                } else if opc.hasjabs.contains(op) {
                    pattr = Some(oparg.to_string());
                } else if opc.haslocal.contains(op) {
                    pattr = self.varnames.get(oparg).cloned();
                } else if opc.hascompare.contains(op) {
                    pattr = opc.cmp_name(oparg).map(str::to_string);
                } else if opc.hasfree.contains(op) {
                    pattr = self.free.get(oparg).cloned();
                }
            }

            if opc.varargs_ops.contains(op) {
                // Closure cells are packed into a tuple right before
                // MAKE_CLOSURE; that tuple build is part of the closure,
                // not a tuple display.
                if op == opc.build_tuple && self.byte_at(self.prev_op(i)) == opc.load_closure {
                    i += size;
                    continue;
                }
                kind = format!("{kind}_{oparg}");
                if op != opc.build_slice {
                    customize.insert(kind.clone(), oparg as u32);
                }
            } else if op == opc.ja {
                let target = self.jump_target(i);
                if target < i {
                    let successor_blocked = matches!(
                        self.code.get(i + 3),
                        Some(&next) if next == opc.end_finally || next == opc.pop_block
                    );
                    kind = if self.stmts.contains(&i)
                        && !successor_blocked
                        && !self.not_continue.contains(&i)
                    {
                        "CONTINUE".to_string()
                    } else {
                        "JUMP_BACK".to_string()
                    };
                }
            } else if op == opc.load_global {
                if self.load_asserts.contains(&i) {
                    kind = "LOAD_ASSERT".to_string();
                }
            } else if op == opc.return_value {
                if self.return_end_ifs.contains(&i) {
                    kind = "RETURN_END_IF".to_string();
                }
            }

            if let Some(&replacement) = replace.get(&i) {
                kind = replacement.to_string();
            }

            let token = Token {
                kind,
                arg,
                pattr,
                offset: TokenOffset::Real(i),
                line_start: self.linestart_offsets.get(&i).copied(),
            };
            trace!("{token}");
            tokens.push(token);
            i += size;
        }

        Disassembly { tokens, customize }
    }

    /// Statements continuing an already-started statement on the same
    /// source line print differently (`print 1, 2` is one print), so
    /// their tokens get `_CONT` names. Computed once before emission.
    fn continuation_replacements(&self) -> FxHashMap<usize, &'static str> {
        let opc = self.opc;
        let n = self.code.len();
        let mut replace = FxHashMap::default();

        let skip = usize::from(self.stmt_list.first() == Some(&0));
        for pair in self.stmt_list.windows(2).skip(skip) {
            let (last, current) = (pair[0], pair[1]);
            if current + 1 >= n {
                break;
            }
            if self.lines[last].next > current && self.code[last] == opc.print_item {
                if self.code[current] == opc.print_item {
                    replace.insert(current, "PRINT_ITEM_CONT");
                } else if self.code[current] == opc.print_newline {
                    replace.insert(current, "PRINT_NEWLINE_CONT");
                }
            }
        }

        let import_ops =
            pyrite_opcodes::OpSet::of(&[opc.import_name, opc.import_from, opc.import_star]);
        let imports = self.all_instr(0, n, import_ops, None, false);
        if imports.len() > 1 {
            let mut last_import = imports[0];
            for &current in &imports[1..] {
                if self.lines[last_import].next > current
                    && self.code[last_import] == opc.import_name
                    && self.code[current] == opc.import_name
                {
                    replace.insert(current, "IMPORT_NAME_CONT");
                }
                last_import = current;
            }
        }

        replace
    }
}
