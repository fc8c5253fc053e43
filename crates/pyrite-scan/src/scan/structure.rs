//! Structural analysis: recovering the block tree from the jump graph.
//!
//! The compiler flattens loops, try/except, conditionals, and
//! short-circuit tests into one linear jump graph, and the peephole
//! optimizer then reroutes jumps straight through intermediate ones.
//! This pass walks every instruction once, classifies the block each
//! structural opcode opens, and records jump-target overrides
//! (`fixed_jumps`) that undo the optimizer's shortcuts so block
//! boundaries become unambiguous again. The collected target map drives
//! `COME_FROM` emission.

use log::trace;
use pyrite_opcodes::OpSet;
use rustc_hash::FxHashMap;

use super::{ScanError, Scanner};

/// Kind tag of a recovered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// The whole code object.
    Root,
    /// `for` loop body.
    ForLoop,
    /// `while` loop body.
    WhileLoop,
    /// `while 1` loop body (no runtime test).
    While1Loop,
    /// `else` suite of a `for` loop.
    ForElse,
    /// `else` suite of a `while` loop.
    WhileElse,
    /// `else` suite of a `while 1` loop.
    While1Else,
    /// `try` suite.
    Try,
    /// One `except` handler suite.
    Except,
    /// `else` suite of a `try`.
    TryElse,
    /// Then-branch of a conditional.
    IfThen,
    /// Else-branch of a conditional.
    IfElse,
    /// Short-circuit region of a chained condition.
    AndOr,
}

impl BlockKind {
    fn else_kind(self) -> BlockKind {
        match self {
            BlockKind::ForLoop => BlockKind::ForElse,
            BlockKind::While1Loop => BlockKind::While1Else,
            _ => BlockKind::WhileElse,
        }
    }
}

/// A region of bytecode tagged with its block kind. Blocks strictly
/// nest: any two are disjoint or one contains the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Kind tag.
    pub kind: BlockKind,
    /// First offset inside the region.
    pub start: usize,
    /// First offset past the region, at instruction granularity.
    pub end: usize,
}

/// Override of an instruction's natural jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FixedJump {
    /// The effective target is this offset.
    To(usize),
    /// The jump terminates an except handler; it must not surface as a
    /// resolvable target of its own. The landing offset is still
    /// published through the chain's `END_FINALLY` entry.
    Suppressed,
}

impl Scanner {
    /// The innermost already-recovered block containing `pos`.
    fn enclosing_block(&self, pos: usize) -> Block {
        let mut parent = self.blocks[0];
        for &block in &self.blocks {
            if block.start <= pos
                && pos < block.end
                && block.start >= parent.start
                && block.end <= parent.end
            {
                parent = block;
            }
        }
        parent
    }

    /// Walk all instructions, classifying structure and collecting the
    /// map from jump target to the offsets jumping there.
    pub(crate) fn find_jump_targets(&mut self) -> Result<FxHashMap<usize, Vec<usize>>, ScanError> {
        let n = self.code.len();
        self.blocks = vec![Block {
            kind: BlockKind::Root,
            start: 0,
            end: n.saturating_sub(1),
        }];
        self.loops.clear();
        self.fixed_jumps.clear();
        self.ignore_if.clear();
        self.build_stmt_indices();
        self.not_continue.clear();
        self.return_end_ifs.clear();

        let mut targets: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
        let mut i = 0;
        while i < n {
            let op = self.code[i];
            self.detect_structure(i)?;

            if op >= self.opc.have_argument {
                let oparg = self.argument(i);
                let label = match self.fixed_jumps.get(&i) {
                    Some(FixedJump::To(t)) => Some(*t),
                    Some(FixedJump::Suppressed) => None,
                    None => {
                        if self.opc.hasjrel.contains(op) && op != self.opc.for_iter {
                            Some(i + 3 + oparg)
                        } else if self.caps.or_pop_targets
                            && self.opc.hasjabs.contains(op)
                            && self.opc.pop_jump_if_or_pop.contains(op)
                            && oparg > i
                        {
                            Some(oparg)
                        } else {
                            None
                        }
                    }
                };
                if let Some(label) = label {
                    targets.entry(label).or_default().push(i);
                }
            } else if op == self.opc.end_finally {
                if let Some(&FixedJump::To(label)) = self.fixed_jumps.get(&i) {
                    targets.entry(label).or_default().push(i);
                }
            }
            i += self.op_size(op);
        }
        Ok(targets)
    }

    fn detect_structure(&mut self, pos: usize) -> Result<(), ScanError> {
        let op = self.code[pos];
        let parent = self.enclosing_block(pos);
        if op == self.opc.setup_loop {
            self.detect_loop(pos, parent);
        } else if op == self.opc.setup_except {
            self.detect_try_except(pos, parent)?;
        } else if op == self.opc.pjif || op == self.opc.pjit {
            self.detect_cond_jump(pos, op, parent);
        } else if self.opc.pop_jump_if_or_pop.contains(op) {
            let target = self.jump_target(pos);
            let clamped = self.restrict_to_parent(target, parent);
            self.fixed_jumps.insert(pos, FixedJump::To(clamped));
        }
        Ok(())
    }

    fn detect_loop(&mut self, pos: usize, parent: Block) {
        let opc = self.opc;
        let start = pos + 3;
        let mut target = self.jump_target(pos);
        let mut end = self.restrict_to_parent(target, parent);
        if target != end {
            self.fixed_jumps.insert(pos, FixedJump::To(end));
        }

        let next_line_byte = self.lines[pos].next;
        let ja_set = OpSet::of(&[opc.ja]);
        let mut jump_back = self.last_instr(start, end, ja_set, Some(next_line_byte), false);

        // A loop whose last statement is a return compiles without the
        // back edge right before POP_BLOCK; the jump found above then
        // belongs to something else.
        if let Some(jb) = jump_back {
            if jb != self.prev_op(end) && self.jump_forward.contains(self.byte_at(jb + 3)) {
                let before_end = self.prev_op(end);
                if self.byte_at(before_end) == opc.return_value
                    || (self.byte_at(before_end) == opc.pop_block
                        && self.byte_at(self.prev_op(before_end)) == opc.return_value)
                {
                    jump_back = None;
                }
            }
        }

        let kind;
        let jump_back = match jump_back {
            None => {
                let Some(last_return) =
                    self.last_instr(start, end, OpSet::of(&[opc.return_value]), None, true)
                else {
                    return;
                };
                let jb = last_return + 1;
                let test = self.prev_op(next_line_byte);
                if !self.pop_jump_if.contains(self.byte_at(test)) {
                    kind = BlockKind::ForLoop;
                } else {
                    kind = BlockKind::WhileLoop;
                    self.ignore_if.insert(test);
                }
                target = next_line_byte;
                end = jb + 3;
                jb
            }
            Some(found) => {
                let mut jb = found;
                if self.jump_target(jb) >= next_line_byte {
                    match self.last_instr(start, end, ja_set, Some(start), false) {
                        Some(back_to_start) => jb = back_to_start,
                        None => return,
                    }
                }
                if end > jb + 4 && self.jump_forward.contains(self.byte_at(end)) {
                    if self.jump_forward.contains(self.byte_at(jb + 4))
                        && self.jump_target(jb + 4) == self.jump_target(end)
                    {
                        self.fixed_jumps.insert(pos, FixedJump::To(jb + 4));
                        end = jb + 4;
                    }
                } else if target < pos {
                    self.fixed_jumps.insert(pos, FixedJump::To(jb + 4));
                    end = jb + 4;
                }

                target = self.jump_target(jb);
                if self.byte_at(target) == opc.for_iter || self.byte_at(target) == opc.get_iter {
                    kind = BlockKind::ForLoop;
                } else {
                    let test = self.prev_op(next_line_byte);
                    if test == pos {
                        kind = BlockKind::While1Loop;
                    } else {
                        kind = BlockKind::WhileLoop;
                        if opc.jump_ops.contains(self.byte_at(test)) {
                            self.ignore_if.insert(test);
                            let test_target = self.jump_target(test);
                            if test_target > jb + 3 {
                                jb = test_target;
                            }
                        }
                    }
                }
                self.not_continue.insert(jb);
                jb
            }
        };

        self.loops.push(target);
        trace!("{:?} over {}..{} (SETUP_LOOP at {})", kind, target, jump_back, pos);
        self.blocks.push(Block {
            kind,
            start: target,
            end: jump_back,
        });
        if jump_back + 3 != end {
            self.blocks.push(Block {
                kind: kind.else_kind(),
                start: jump_back + 3,
                end,
            });
        }
    }

    fn detect_try_except(&mut self, pos: usize, parent: Block) -> Result<(), ScanError> {
        let opc = self.opc;
        let n = self.code.len();
        let start = pos + 3;
        let target = self.jump_target(pos);
        let end = self.restrict_to_parent(target, parent);
        if target != end {
            self.fixed_jumps.insert(pos, FixedJump::To(end));
        }
        self.blocks.push(Block {
            kind: BlockKind::Try,
            start,
            end: end.saturating_sub(4),
        });

        // The jump before the first handler lands on the else suite (or
        // the join when there is none); handlers that jump elsewhere
        // stretch the else region.
        let start_else = self.jump_target(self.prev_op(end));
        let mut end_else = start_else;

        let mut i = end;
        while i < n && self.code[i] != opc.end_finally {
            let before = i;
            let Some(jmp) = self.next_except_jump(i)? else {
                i = self.stmt_after(i);
                if i <= before {
                    break;
                }
                continue;
            };
            if self.byte_at(jmp) == opc.return_value {
                self.blocks.push(Block {
                    kind: BlockKind::Except,
                    start: i,
                    end: jmp + 1,
                });
                i = jmp + 1;
            } else {
                if self.jump_target(jmp) != start_else {
                    end_else = self.jump_target(jmp);
                }
                if self.byte_at(jmp) == opc.jf {
                    self.fixed_jumps.insert(jmp, FixedJump::Suppressed);
                }
                self.blocks.push(Block {
                    kind: BlockKind::Except,
                    start: i,
                    end: jmp,
                });
                i = jmp + 3;
            }
            if i <= before {
                // a handler chain that loops back on itself is malformed;
                // bail rather than spin
                break;
            }
        }

        if end_else != start_else {
            let clamped = self.restrict_to_parent(end_else, parent);
            self.blocks.push(Block {
                kind: BlockKind::TryElse,
                start: i + 1,
                end: clamped,
            });
            self.fixed_jumps.insert(i, FixedJump::To(clamped));
        } else {
            self.fixed_jumps.insert(i, FixedJump::To(i + 1));
        }
        trace!("try at {}..{} with handlers to {}", start, end, i);
        Ok(())
    }

    /// The jump closing the except handler that starts at `start`: for
    /// a tested handler (`except E:`), the instruction before the
    /// landing of its match test; for a bare handler, the instruction
    /// before the `END_FINALLY` that balances open setup blocks.
    fn next_except_jump(&mut self, start: usize) -> Result<Option<usize>, ScanError> {
        let opc = self.opc;
        let n = self.code.len();

        if self.byte_at(start) == opc.dup_top {
            if let Some(except_match) =
                self.first_instr(start, n, OpSet::of(&[opc.pjif]), None, true)
            {
                let jmp = self.prev_op(self.jump_target(except_match));
                self.ignore_if.insert(except_match);
                self.not_continue.insert(jmp);
                return Ok(Some(jmp));
            }
        }

        let mut end_finally_count = 0usize;
        let mut setup_count = 0usize;
        let offsets: Vec<usize> = self.op_range(start, n).collect();
        for i in offsets {
            let op = self.code[i];
            if op == opc.end_finally {
                if end_finally_count == setup_count {
                    let before = self.prev_op(i);
                    let before_op = self.byte_at(before);
                    if self.caps.strict_except_tail
                        && !(self.jump_forward.contains(before_op)
                            || before_op == opc.return_value)
                    {
                        return Err(ScanError::UnexpectedExceptTail {
                            offset: before,
                            opname: self.opname_string(before_op),
                        });
                    }
                    self.not_continue.insert(before);
                    return Ok(Some(before));
                }
                end_finally_count += 1;
            } else if opc.setup_ops.contains(op) {
                setup_count += 1;
            }
        }
        Ok(None)
    }

    fn detect_cond_jump(&mut self, pos: usize, op: u8, parent: Block) {
        let opc = self.opc;
        let start = pos + 3;
        let target = self.jump_target(pos);
        let mut rtarget = self.restrict_to_parent(target, parent);

        // Inside a short-circuit region, a jump out of the parent just
        // needs clamping.
        if target != rtarget && parent.kind == BlockKind::AndOr {
            self.fixed_jumps.insert(pos, FixedJump::To(rtarget));
            return;
        }

        // Jumping to right after another conditional jump means this
        // test is a clause of a larger chained condition.
        let pre_target = self.prev_op(target);
        if target > pos
            && (self.pop_jump_if.contains(self.byte_at(pre_target))
                || opc.pop_jump_if_or_pop.contains(self.byte_at(pre_target)))
        {
            self.fixed_jumps.insert(pos, FixedJump::To(pre_target));
            self.blocks.push(Block {
                kind: BlockKind::AndOr,
                start,
                end: pre_target,
            });
            trace!("and/or {}..{} (test at {})", start, pre_target, pos);
            return;
        }

        if op == opc.pjif {
            self.detect_false_branch(pos, start, target, rtarget, parent);
            // detect_false_branch handles the common collapses; when it
            // records a fix it is done with this offset.
            if self.fixed_jumps.contains_key(&pos) {
                return;
            }
        } else {
            if self.detect_true_branch(pos, target, rtarget) {
                return;
            }
        }

        // A loop test's jump is already accounted for by its loop.
        if self.ignore_if.contains(&pos) {
            return;
        }

        // An if whose then-suite ends in a back jump that is itself a
        // statement belongs to the statement before the join.
        let pre_rt = self.prev_op(rtarget);
        if self.byte_at(pre_rt) == opc.ja
            && self.stmts.contains(&pre_rt)
            && pre_rt != pos
            && self.prev_op(pre_rt) != pos
        {
            if self.byte_at(rtarget) == opc.ja && self.byte_at(rtarget + 3) == opc.pop_block {
                let pre2 = self.prev_op(pre_rt);
                if self.byte_at(pre2) != opc.ja {
                    // keep rtarget
                } else if self.jump_target(pre2) != target {
                    // keep rtarget
                } else {
                    rtarget = pre_rt;
                }
            } else {
                rtarget = pre_rt;
            }
        }

        // A then-suite ending just beyond a forward jump is an if (the
        // jump skips the else); one ending in a return closes the suite
        // itself.
        let pre_rt = self.prev_op(rtarget);
        if self.jump_forward.contains(self.byte_at(pre_rt)) {
            let if_end = self.jump_target(pre_rt);
            // a backward landing right after a SETUP_LOOP is the loop's
            // own plumbing, not an if
            if if_end < pre_rt && self.byte_at(self.prev_op(if_end)) == opc.setup_loop {
                if if_end > start {
                    return;
                }
            }
            let end = self.restrict_to_parent(if_end, parent);
            self.blocks.push(Block {
                kind: BlockKind::IfThen,
                start,
                end: pre_rt,
            });
            self.not_continue.insert(pre_rt);
            trace!("if-then {}..{} else to {}", start, pre_rt, end);
            if rtarget < end {
                self.blocks.push(Block {
                    kind: BlockKind::IfElse,
                    start: rtarget,
                    end,
                });
            }
        } else if self.byte_at(pre_rt) == opc.return_value {
            self.blocks.push(Block {
                kind: BlockKind::IfThen,
                start,
                end: rtarget,
            });
            self.return_end_ifs.insert(pre_rt);
            trace!("if-then {}..{} ending in return", start, rtarget);
        }
    }

    /// `PJIF`: fold the other false-branch tests of an `and` chain
    /// under this one, so a single jump represents the whole test.
    fn detect_false_branch(
        &mut self,
        pos: usize,
        start: usize,
        target: usize,
        rtarget: usize,
        parent: Block,
    ) {
        let opc = self.opc;
        let next_stmt = self.stmt_after(pos);
        let chained = self.rem_or(
            start,
            next_stmt,
            OpSet::of(&[opc.pjif]),
            Some(target),
            false,
        );
        if chained.is_empty() {
            return;
        }

        let pre_rt = self.prev_op(rtarget);
        let pre2 = self.prev_op(pre_rt);
        let joins_at_forward_jump = self.jump_forward.contains(self.byte_at(pre_rt))
            && !self.stmts.contains(&pre_rt)
            && self.restrict_to_parent(self.jump_target(pre_rt), parent) == rtarget;

        if !joins_at_forward_jump {
            self.fixed_jumps
                .insert(pos, FixedJump::To(chained[chained.len() - 1]));
            return;
        }

        // The suite before the join collapses into a single test when
        // exactly one chained jump remains after filtering; then the
        // outer statement owns this jump and no fix is recorded.
        let lone_test_before_ja = self.byte_at(pre2) == opc.ja
            && !self.remove_mid_line_ifs(&[pos]).is_empty()
            && target == self.jump_target(pre2)
            && (!self.stmts.contains(&pre2) || self.jump_target(pre2) > pre2)
            && 1 == {
                let inner = self.rem_or(start, pre2, self.pop_jump_if, Some(target), false);
                self.remove_mid_line_ifs(&inner).len()
            };
        if lone_test_before_ja {
            return;
        }
        let lone_test_before_return = self.byte_at(pre2) == opc.return_value
            && !self.remove_mid_line_ifs(&[pos]).is_empty()
            && 1 == {
                let by_target = self.rem_or(start, pre2, self.pop_jump_if, Some(target), false);
                let by_join = self.rem_or(
                    start,
                    pre2,
                    OpSet::of(&[opc.pjif, opc.pjit, opc.ja]),
                    Some(pre_rt),
                    true,
                );
                let mut all: Vec<usize> = self.remove_mid_line_ifs(&by_target);
                all.extend(self.remove_mid_line_ifs(&by_join));
                all.sort_unstable();
                all.dedup();
                all.len()
            };
        if lone_test_before_return {
            return;
        }

        // Prefer the first chained jump whose line ends right after it;
        // a jump off that pattern breaks the contiguous chain.
        let mut fix = None;
        let mut last_jump_good = true;
        for j in self.all_instr(start, next_stmt, OpSet::of(&[opc.pjif]), None, false) {
            if target == self.jump_target(j) {
                if self.lines.get(j).map(|entry| entry.next) == Some(j + 3) && last_jump_good {
                    fix = Some(j);
                    break;
                }
            } else {
                last_jump_good = false;
            }
        }
        self.fixed_jumps
            .insert(pos, FixedJump::To(fix.unwrap_or(chained[chained.len() - 1])));
    }

    /// `PJIT`: assertion confirmation and or-chain folding. Returns
    /// true when the jump is fully accounted for.
    fn detect_true_branch(&mut self, pos: usize, target: usize, rtarget: usize) -> bool {
        let opc = self.opc;

        // An assert's test jumps over LOAD_ASSERT ... RAISE_VARARGS.
        if self.load_asserts.contains(&(pos + 3)) {
            if self.byte_at(self.prev_op(rtarget)) == opc.raise_varargs {
                return true;
            }
            self.load_asserts.remove(&(pos + 3));
        }

        let next = self.stmt_after(pos);
        if self.prev_op(next) == pos {
            return false;
        }
        if self.jump_forward.contains(self.byte_at(next)) && target == self.jump_target(next) {
            if self.byte_at(self.prev_op(next)) == opc.pjif {
                let pre2 = self.prev_op(self.prev_op(rtarget));
                let pre2_op = self.byte_at(pre2);
                if self.byte_at(next) == opc.jf
                    || target != rtarget
                    || !(pre2_op == opc.ja || pre2_op == opc.return_value)
                {
                    self.fixed_jumps
                        .insert(pos, FixedJump::To(self.prev_op(next)));
                    return true;
                }
            }
        } else if self.byte_at(next) == opc.ja && self.jump_forward.contains(self.byte_at(target))
        {
            let next_target = self.jump_target(next);
            if self.jump_target(target) == next_target {
                self.fixed_jumps
                    .insert(pos, FixedJump::To(self.prev_op(next)));
                return true;
            } else if self.jump_forward.contains(self.byte_at(next_target))
                && self.jump_target(next_target) == self.jump_target(target)
            {
                self.fixed_jumps
                    .insert(pos, FixedJump::To(self.prev_op(next)));
                return true;
            }
        }
        false
    }
}
