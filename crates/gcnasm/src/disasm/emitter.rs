//! Label and relocation emission for the disassembler.
//!
//! The decoder walks the code section in ascending offset order; the emitter
//! interleaves label definitions with the decoded text. Labels normally land
//! between instructions and print as `label:`; a branch target inside a
//! multi-byte instruction is defined with `label=.-N` once the instruction
//! covering it has been written. Labels beyond the decoded range are reached
//! with an `.org` directive after the last instruction.

use std::{fmt, io};

use crate::text::Text;

/// Buffered output with a reserve/commit discipline: callers reserve room,
/// append into the returned buffer, and the buffer drains to the underlying
/// writer once it crosses its capacity.
pub struct FastOutputBuffer<W: io::Write> {
    writer: W,
    buffer: Vec<u8>,
    capacity: usize,
}

impl<W: io::Write> FastOutputBuffer<W> {
    pub fn new(capacity: usize, writer: W) -> FastOutputBuffer<W> {
        FastOutputBuffer {
            writer,
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Make room for `size` more bytes, draining buffered output first if it
    /// would not fit.
    pub fn reserve(&mut self, size: usize) -> io::Result<&mut Vec<u8>> {
        if self.buffer.len() + size > self.capacity {
            self.flush()?;
        }
        Ok(&mut self.buffer)
    }

    pub fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.reserve(s.len())?.extend_from_slice(s.as_bytes());
        Ok(())
    }

    /// Lets `write!(out, ...)` produce `io::Result` directly.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        {
            use io::Write as _;
            self.buffer.write_fmt(args)?;
        }
        if self.buffer.len() >= self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.write_all(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    /// Drain the buffer and hand the writer back.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush()?;
        Ok(self.writer)
    }
}

impl<W: io::Write> io::Write for FastOutputBuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reserve(buf.len())?.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        FastOutputBuffer::flush(self)
    }
}

/// How a relocated operand uses its symbol's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Abs32,
    Low32,
    High32,
}

#[derive(Debug, Clone)]
pub struct Relocation {
    /// Index into the emitter's relocation symbol table.
    pub symbol: usize,
    pub addend: i64,
    pub kind: RelocKind,
}

/// Emits labels, `.org` fills, and relocation-aware operands around a
/// decoded instruction stream.
pub struct IsaEmitter<W: io::Write> {
    output: FastOutputBuffer<W>,
    section_count: u32,
    labels: Vec<usize>,
    named_labels: Vec<(usize, Text)>,
    relocations: Vec<(usize, Relocation)>,
    rel_symbols: Vec<Text>,
    label_iter: usize,
    named_iter: usize,
    reloc_iter: usize,
}

impl<W: io::Write> IsaEmitter<W> {
    pub fn new(output: FastOutputBuffer<W>, section_count: u32) -> IsaEmitter<W> {
        IsaEmitter {
            output,
            section_count,
            labels: Vec::new(),
            named_labels: Vec::new(),
            relocations: Vec::new(),
            rel_symbols: Vec::new(),
            label_iter: 0,
            named_iter: 0,
            reloc_iter: 0,
        }
    }

    pub fn output(&mut self) -> &mut FastOutputBuffer<W> {
        &mut self.output
    }

    pub fn add_label(&mut self, offset: usize) {
        self.labels.push(offset);
    }

    pub fn add_named_label(&mut self, offset: usize, name: impl Into<Text>) {
        self.named_labels.push((offset, name.into()));
    }

    pub fn add_rel_symbol(&mut self, name: impl Into<Text>) -> usize {
        self.rel_symbols.push(name.into());
        self.rel_symbols.len() - 1
    }

    pub fn add_relocation(&mut self, offset: usize, reloc: Relocation) {
        self.relocations.push((offset, reloc));
    }

    /// Sort the tables and rewind the emission cursors. Called once all
    /// branch targets have been discovered, before the emission pass.
    pub fn prepare(&mut self) {
        self.labels.sort_unstable();
        self.labels.dedup();
        self.named_labels.sort_by(|a, b| a.0.cmp(&b.0));
        self.relocations.sort_by(|a, b| a.0.cmp(&b.0));
        self.label_iter = 0;
        self.named_iter = 0;
        self.reloc_iter = 0;
    }

    /// The offset of the nearest label not yet emitted, if any. Data dumps
    /// use this to break at label boundaries.
    pub fn next_label(&self) -> Option<usize> {
        let numbered = self.labels.get(self.label_iter).copied();
        let named = self.named_labels.get(self.named_iter).map(|(p, _)| *p);
        match (numbered, named) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }

    /// Emit every pending label with offset `<= pos`, numbered labels first
    /// on ties. A label short of `pos` lies inside the previously written
    /// instruction and is defined relative to the current position.
    pub fn flush_labels_to(&mut self, pos: usize) -> io::Result<()> {
        loop {
            let have_numbered =
                self.label_iter < self.labels.len() && self.labels[self.label_iter] <= pos;
            let have_named = self.named_iter < self.named_labels.len()
                && self.named_labels[self.named_iter].0 <= pos;
            if !have_numbered && !have_named {
                break;
            }

            let numbered_pos = if have_numbered {
                self.labels[self.label_iter]
            } else {
                usize::MAX
            };
            let named_pos = if have_named {
                self.named_labels[self.named_iter].0
            } else {
                usize::MAX
            };

            if numbered_pos <= named_pos && have_numbered {
                write!(self.output, ".L{}_{}", numbered_pos, self.section_count)?;
                if numbered_pos != pos {
                    writeln!(self.output, "=.-{}", pos - numbered_pos)?;
                } else {
                    self.output.write_str(":\n")?;
                }
                self.label_iter += 1;
            }
            if named_pos <= numbered_pos && have_named {
                let name = self.named_labels[self.named_iter].1.clone();
                self.output.write_str(&name)?;
                if named_pos != pos {
                    writeln!(self.output, "=.-{}", pos - named_pos)?;
                } else {
                    self.output.write_str(":\n")?;
                }
                self.named_iter += 1;
            }
        }
        Ok(())
    }

    /// Emit the labels remaining after the last instruction, moving the
    /// cursor forward with `.org` where they lie beyond `start`.
    pub fn flush_labels_to_end(&mut self, start: usize) -> io::Result<()> {
        let mut pos = start;
        while self.label_iter < self.labels.len() || self.named_iter < self.named_labels.len() {
            let numbered_pos = if self.label_iter < self.labels.len() {
                self.labels[self.label_iter]
            } else {
                usize::MAX
            };
            let named_pos = if self.named_iter < self.named_labels.len() {
                self.named_labels[self.named_iter].0
            } else {
                usize::MAX
            };

            if numbered_pos <= named_pos && self.label_iter < self.labels.len() {
                if pos != numbered_pos {
                    writeln!(self.output, ".org {numbered_pos:#x}")?;
                }
                writeln!(self.output, ".L{}_{}:", numbered_pos, self.section_count)?;
                pos = numbered_pos;
                self.label_iter += 1;
            }
            if named_pos <= numbered_pos && self.named_iter < self.named_labels.len() {
                if pos != named_pos {
                    writeln!(self.output, ".org {named_pos:#x}")?;
                }
                let name = self.named_labels[self.named_iter].1.clone();
                self.output.write_str(&name)?;
                self.output.write_str(":\n")?;
                pos = named_pos;
                self.named_iter += 1;
            }
        }
        Ok(())
    }

    /// Write the label that covers `pos` as an operand; a named label wins
    /// over the numbered form.
    pub fn write_location(&mut self, pos: usize) -> io::Result<()> {
        if let Ok(idx) = self.named_labels.binary_search_by(|(p, _)| p.cmp(&pos)) {
            let name = self.named_labels[idx].1.clone();
            return self.output.write_str(&name);
        }
        write!(self.output, ".L{}_{}", pos, self.section_count)
    }

    /// If a relocation applies at `pos`, write its operand expression and
    /// consume it. Returns whether one was written, so the caller can skip
    /// emitting the literal value.
    pub fn write_relocation(&mut self, pos: usize) -> io::Result<bool> {
        while self.reloc_iter < self.relocations.len() && self.relocations[self.reloc_iter].0 < pos
        {
            self.reloc_iter += 1;
        }
        if self.reloc_iter == self.relocations.len() || self.relocations[self.reloc_iter].0 != pos {
            return Ok(false);
        }
        let reloc = self.relocations[self.reloc_iter].1.clone();
        let wrapped =
            reloc.addend != 0 && matches!(reloc.kind, RelocKind::Low32 | RelocKind::High32);
        if wrapped {
            self.output.write_str("(")?;
        }
        let symbol = self.rel_symbols[reloc.symbol].clone();
        self.output.write_str(&symbol)?;
        if reloc.addend != 0 {
            if reloc.addend > 0 {
                self.output.write_str("+")?;
            }
            write!(self.output, "{}", reloc.addend)?;
            if wrapped {
                self.output.write_str(")")?;
            }
        }
        match reloc.kind {
            RelocKind::Abs32 => {}
            RelocKind::Low32 => self.output.write_str("&0xffffffff")?,
            RelocKind::High32 => self.output.write_str(">>32")?,
        }
        self.reloc_iter += 1;
        Ok(true)
    }

    pub fn finish(self) -> io::Result<W> {
        self.output.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter() -> IsaEmitter<Vec<u8>> {
        IsaEmitter::new(FastOutputBuffer::new(128, Vec::new()), 0)
    }

    fn text(emitter: IsaEmitter<Vec<u8>>) -> String {
        String::from_utf8(emitter.finish().unwrap()).unwrap()
    }

    #[test]
    fn labels_at_instruction_boundaries() {
        let mut e = emitter();
        e.add_label(8);
        e.add_label(0);
        e.prepare();

        e.flush_labels_to(0).unwrap();
        e.output().write_str("        first\n").unwrap();
        e.flush_labels_to(8).unwrap();
        e.output().write_str("        second\n").unwrap();
        e.flush_labels_to_end(12).unwrap();

        assert_eq!(
            text(e),
            ".L0_0:\n        first\n.L8_0:\n        second\n"
        );
    }

    #[test]
    fn label_inside_an_instruction_is_defined_backwards() {
        let mut e = emitter();
        e.add_label(4);
        e.prepare();

        e.flush_labels_to(0).unwrap();
        e.output().write_str("        wide_instr\n").unwrap();
        e.flush_labels_to(8).unwrap();
        e.output().write_str("        next\n").unwrap();
        e.flush_labels_to_end(12).unwrap();

        assert_eq!(
            text(e),
            "        wide_instr\n.L4_0=.-4\n        next\n"
        );
    }

    #[test]
    fn numbered_label_wins_a_tie_with_a_named_one() {
        let mut e = emitter();
        e.add_label(4);
        e.add_named_label(4, "kernel_entry");
        e.prepare();

        e.flush_labels_to(4).unwrap();
        e.output().write_str("        instr\n").unwrap();
        e.flush_labels_to_end(8).unwrap();

        assert_eq!(
            text(e),
            ".L4_0:\nkernel_entry:\n        instr\n"
        );
    }

    #[test]
    fn tail_labels_are_reached_with_org() {
        let mut e = emitter();
        e.add_label(16);
        e.add_named_label(32, "data_end");
        e.prepare();

        e.flush_labels_to_end(8).unwrap();

        assert_eq!(
            text(e),
            ".org 0x10\n.L16_0:\n.org 0x20\ndata_end:\n"
        );
    }

    #[test]
    fn every_label_is_emitted_exactly_once_in_offset_order() {
        let mut e = emitter();
        for offset in [12, 4, 4, 0, 8] {
            e.add_label(offset);
        }
        e.prepare();
        for pos in [0, 4, 8, 12] {
            e.flush_labels_to(pos).unwrap();
            e.output().write_str("i\n").unwrap();
        }
        e.flush_labels_to_end(16).unwrap();

        let out = text(e);
        let labels: Vec<&str> = out
            .lines()
            .filter(|l| l.starts_with(".L"))
            .collect();
        assert_eq!(labels, [".L0_0:", ".L4_0:", ".L8_0:", ".L12_0:"]);
    }

    #[test]
    fn location_prefers_named_labels() {
        let mut e = emitter();
        e.add_label(4);
        e.add_named_label(4, "loop");
        e.prepare();
        e.write_location(4).unwrap();
        e.output().write_str(" ").unwrap();
        e.write_location(8).unwrap();

        assert_eq!(text(e), "loop .L8_0");
    }

    #[test]
    fn relocation_expressions() {
        let mut e = emitter();
        let sym = e.add_rel_symbol("globaldata");
        e.add_relocation(
            0,
            Relocation {
                symbol: sym,
                addend: 0,
                kind: RelocKind::Low32,
            },
        );
        e.add_relocation(
            4,
            Relocation {
                symbol: sym,
                addend: 8,
                kind: RelocKind::High32,
            },
        );
        e.add_relocation(
            8,
            Relocation {
                symbol: sym,
                addend: -4,
                kind: RelocKind::Abs32,
            },
        );
        e.prepare();

        assert!(e.write_relocation(0).unwrap());
        e.output().write_str("\n").unwrap();
        assert!(e.write_relocation(4).unwrap());
        e.output().write_str("\n").unwrap();
        assert!(e.write_relocation(8).unwrap());
        e.output().write_str("\n").unwrap();
        assert!(!e.write_relocation(12).unwrap());

        assert_eq!(
            text(e),
            "globaldata&0xffffffff\n(globaldata+8)>>32\nglobaldata-4\n"
        );
    }
}
