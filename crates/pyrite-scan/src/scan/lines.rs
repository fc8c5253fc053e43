//! Per-offset line bookkeeping.

use crate::code::CodeObject;

use super::Scanner;

/// Line information for one byte of code: the source line owning it and
/// the first byte of the next source line (the truncated length when no
/// line follows).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LineEntry {
    pub l_no: u32,
    pub next: usize,
}

impl Scanner {
    /// Fill `lines[0..n]` from the code object's line-number program
    /// and record which offsets begin a line.
    pub(crate) fn build_lines_data(&mut self, co: &CodeObject, n: usize) {
        let starts = co.line_starts();
        self.linestart_offsets = starts.iter().copied().collect();
        self.lines.clear();
        if starts.is_empty() {
            self.lines.extend((0..n).map(|_| LineEntry {
                l_no: co.first_line,
                next: n,
            }));
            return;
        }
        let mut prev_line = starts[0].1;
        for &(start_byte, line_no) in &starts[1..] {
            while self.lines.len() < start_byte.min(n) {
                self.lines.push(LineEntry {
                    l_no: prev_line,
                    next: start_byte,
                });
            }
            prev_line = line_no;
        }
        while self.lines.len() < n {
            self.lines.push(LineEntry {
                l_no: prev_line,
                next: n,
            });
        }
    }
}
