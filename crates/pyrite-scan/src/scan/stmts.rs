//! Statement-boundary analysis.
//!
//! Seeds candidate offsets from the statement-opcode category, adds the
//! jump-over-jump shapes a bare `pass` compiles to, then strikes the
//! candidates that only look like statements: loop back-edges that
//! share their statement's line, list-comprehension plumbing, swap
//! leftovers, and loop induction-variable stores.

use rustc_hash::FxHashSet;

use super::Scanner;

impl Scanner {
    pub(crate) fn build_stmt_indices(&mut self) {
        let opc = self.opc;
        let n = self.code.len();

        let prelim = self.all_instr(0, n, opc.stmt_opcodes, None, false);
        self.stmts = prelim.iter().copied().collect();

        // A pass statement in a conditional compiles to a conditional
        // jump straight over an unconditional one; the second jump is
        // the statement.
        let mut pass_stmts = FxHashSet::default();
        let sequences = [
            (opc.pjif, opc.jf),
            (opc.pjif, opc.ja),
            (opc.pjit, opc.jf),
            (opc.pjit, opc.ja),
        ];
        let offsets: Vec<usize> = self.op_range(0, n).collect();
        for &(first, second) in &sequences {
            for &i in &offsets {
                let mut j = i;
                let mut matched = true;
                for want in [first, second] {
                    if self.byte_at(j) != want {
                        matched = false;
                        break;
                    }
                    j += self.op_size(self.byte_at(j));
                }
                if matched && j <= n {
                    let s = self.prev_op(j);
                    self.stmts.insert(s);
                    pass_stmts.insert(s);
                }
            }
        }

        let mut stmt_list: Vec<usize> = self.stmts.iter().copied().collect();
        stmt_list.sort_unstable();

        let mut last_stmt: Option<usize> = None;
        let mut survivors = Vec::with_capacity(stmt_list.len());
        for &s in &stmt_list {
            let op = self.code[s];
            if op == opc.ja && !pass_stmts.contains(&s) {
                let target = self.jump_target(s);
                let same_line = last_stmt
                    .is_some_and(|last| self.lines[last].l_no == self.lines[s].l_no);
                if target > s || same_line {
                    self.stmts.remove(&s);
                    continue;
                }
                let mut j = self.prev_op(s);
                while self.byte_at(j) == opc.ja && j > 0 {
                    j = self.prev_op(j);
                }
                if self.byte_at(j) == opc.list_append {
                    // list-comprehension body, not a statement
                    self.stmts.remove(&s);
                    continue;
                }
            } else if op == opc.pop_top && self.byte_at(self.prev_op(s)) == opc.rot_two {
                self.stmts.remove(&s);
                continue;
            } else if opc.designator_ops.contains(op) {
                let mut j = self.prev_op(s);
                while opc.designator_ops.contains(self.byte_at(j)) && j > 0 {
                    j = self.prev_op(j);
                }
                if self.byte_at(j) == opc.for_iter {
                    // the loop induction variable's store
                    self.stmts.remove(&s);
                    continue;
                }
            }
            last_stmt = Some(s);
            survivors.push(s);
        }
        self.stmt_list = survivors;

        // Step vector: next_stmt[k] is the nearest surviving statement
        // at or after k, n past the last one.
        self.next_stmt = vec![n; n + 1];
        let mut remaining = self.stmt_list.len();
        let mut current = n;
        for k in (0..=n).rev() {
            if remaining > 0 && self.stmt_list[remaining - 1] == k {
                current = k;
                remaining -= 1;
            }
            self.next_stmt[k] = current;
        }
    }

    /// The nearest surviving statement strictly after `i` (`n` when
    /// none follows). Walks that must make progress past a statement
    /// offset use this instead of `next_stmt`.
    pub(crate) fn stmt_after(&self, i: usize) -> usize {
        let at = self.stmt_list.partition_point(|&s| s <= i);
        self.stmt_list
            .get(at)
            .copied()
            .unwrap_or(self.code.len())
    }
}
