//! A GCN machine-code walker.
//!
//! Branch discovery and label placement need exact instruction boundaries,
//! so the format map below covers every GCN encoding; textual decoding
//! focuses on the control-flow (SOPP) and local-data-share (DS) formats.
//! Words outside the decoded subset are emitted as `.int` data, never
//! guessed at.

use std::io;

use crate::gpu::GcnArch;

use super::{
    DisasmFlags,
    emitter::IsaEmitter,
    print_disasm_data, print_disasm_data_u32,
};

/// How many 32-bit words the instruction starting with `word` occupies.
fn instr_words(word: u32, arch: GcnArch) -> usize {
    match word >> 26 {
        0b110110 => 2,                                // DS
        0b110100 => 2,                                // VOP3
        0b111000 | 0b111010 | 0b111100 => 2,          // MUBUF, MTBUF, MIMG
        0b111110 => 2,                                // EXP
        0b110111 if arch >= GcnArch::Gcn11 => 2,      // FLAT
        _ => {
            if word >> 23 == 0x17f {
                1 // SOPP
            } else if word >> 23 == 0x17d || word >> 23 == 0x17e {
                // SOP1 / SOPC with a literal-constant source
                if word & 0xff == 0xff { 2 } else { 1 }
            } else if word >> 28 == 0b1011 {
                1 // SOPK
            } else if word >> 30 == 0b10 {
                // SOP2
                if word & 0xff == 0xff || (word >> 8) & 0xff == 0xff {
                    2
                } else {
                    1
                }
            } else if word >> 25 == 0x3f || word >> 25 == 0x3e {
                // VOP1 / VOPC
                if word & 0x1ff == 0xff { 2 } else { 1 }
            } else if word >> 31 == 0 {
                // VOP2
                if word & 0x1ff == 0xff { 2 } else { 1 }
            } else {
                1 // SMRD and the rest of the scalar space
            }
        }
    }
}

fn sopp_op(word: u32) -> u32 {
    (word >> 16) & 0x7f
}

fn is_sopp(word: u32) -> bool {
    word >> 23 == 0x17f
}

fn sopp_branch_target(byte_pos: usize, word: u32) -> i64 {
    let simm = (word & 0xffff) as u16 as i16 as i64;
    byte_pos as i64 + 4 + simm * 4
}

enum SoppOperand {
    None,
    Imm(u32),
    Branch(i64),
}

enum Decoded {
    Sopp(&'static str, SoppOperand),
    Ds(String),
}

/// Decodes a code section and drives the label emitter.
pub struct GcnDisassembler<W: io::Write> {
    emitter: IsaEmitter<W>,
    arch: GcnArch,
    flags: DisasmFlags,
    words: Vec<u32>,
    tail: Vec<u8>,
}

impl<W: io::Write> GcnDisassembler<W> {
    pub fn new(emitter: IsaEmitter<W>, arch: GcnArch, flags: DisasmFlags) -> GcnDisassembler<W> {
        GcnDisassembler {
            emitter,
            arch,
            flags,
            words: Vec::new(),
            tail: Vec::new(),
        }
    }

    pub fn set_input(&mut self, code: &[u8]) {
        let mut chunks = code.chunks_exact(4);
        self.words = chunks
            .by_ref()
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.tail = chunks.remainder().to_vec();
    }

    pub fn emitter(&mut self) -> &mut IsaEmitter<W> {
        &mut self.emitter
    }

    /// Discover branch targets and sort the label tables.
    pub fn before_disassemble(&mut self) {
        let mut w = 0;
        while w < self.words.len() {
            let word = self.words[w];
            if is_sopp(word) && matches!(sopp_op(word), 2 | 4..=9) {
                let target = sopp_branch_target(w * 4, word);
                if target >= 0 {
                    self.emitter.add_label(target as usize);
                }
            }
            w += instr_words(word, self.arch);
        }
        self.emitter.prepare();
    }

    pub fn disassemble(&mut self) -> io::Result<()> {
        let mut w = 0;
        while w < self.words.len() {
            self.emitter.flush_labels_to(w * 4)?;
            match self.decode(w) {
                Some(decoded) => {
                    let size = instr_words(self.words[w], self.arch).min(self.words.len() - w);
                    self.write_instr(w, size, decoded)?;
                    w += size;
                }
                None => {
                    // a run of words outside the decoded subset is kept as
                    // data; it extends over whole instructions and stops at
                    // the next decodable one or the next label boundary
                    let start = w;
                    loop {
                        w += instr_words(self.words[w], self.arch).min(self.words.len() - w);
                        if w >= self.words.len() || self.decode(w).is_some() {
                            break;
                        }
                        if self.emitter.next_label().is_some_and(|l| l <= w * 4) {
                            break;
                        }
                    }
                    print_disasm_data_u32(&self.words[start..w], self.emitter.output(), true)?;
                }
            }
        }

        let words_end = self.words.len() * 4;
        self.emitter.flush_labels_to(words_end)?;
        if !self.tail.is_empty() {
            // input bytes that do not form a full word
            print_disasm_data(&self.tail, self.emitter.output(), true)?;
        }
        self.emitter.flush_labels_to_end(words_end + self.tail.len())
    }

    pub fn finish(self) -> io::Result<W> {
        self.emitter.finish()
    }

    fn decode(&self, w: usize) -> Option<Decoded> {
        let word = self.words[w];
        if is_sopp(word) {
            decode_sopp(word, w * 4).map(|(mnemonic, operand)| Decoded::Sopp(mnemonic, operand))
        } else if word >> 26 == 0b110110 && self.words.len() - w >= 2 {
            decode_ds(word, self.words[w + 1]).map(Decoded::Ds)
        } else {
            None
        }
    }

    fn write_line_prefix(&mut self, w: usize, size: usize) -> io::Result<()> {
        let out = self.emitter.output();
        out.write_str("        ")?;
        if self.flags.contains(DisasmFlags::HEX_CODE) {
            if size == 2 {
                write!(out, "/*{:08x} {:08x}*/ ", self.words[w], self.words[w + 1])?;
            } else {
                write!(out, "/*{:08x}*/ ", self.words[w])?;
            }
        }
        Ok(())
    }

    fn write_instr(&mut self, w: usize, size: usize, decoded: Decoded) -> io::Result<()> {
        self.write_line_prefix(w, size)?;
        match decoded {
            Decoded::Sopp(mnemonic, operand) => match operand {
                SoppOperand::None => writeln!(self.emitter.output(), "{mnemonic}"),
                SoppOperand::Imm(v) => writeln!(self.emitter.output(), "{mnemonic:<16}0x{v:x}"),
                SoppOperand::Branch(target) => {
                    write!(self.emitter.output(), "{mnemonic:<16}")?;
                    if target >= 0 {
                        self.emitter.write_location(target as usize)?;
                    } else {
                        write!(self.emitter.output(), "{target}")?;
                    }
                    self.emitter.output().write_str("\n")
                }
            },
            Decoded::Ds(text) => writeln!(self.emitter.output(), "{text}"),
        }
    }
}

fn decode_sopp(word: u32, byte_pos: usize) -> Option<(&'static str, SoppOperand)> {
    let imm = word & 0xffff;
    let branch = SoppOperand::Branch(sopp_branch_target(byte_pos, word));
    Some(match sopp_op(word) {
        0 => ("s_nop", SoppOperand::Imm(imm)),
        1 => ("s_endpgm", SoppOperand::None),
        2 => ("s_branch", branch),
        4 => ("s_cbranch_scc0", branch),
        5 => ("s_cbranch_scc1", branch),
        6 => ("s_cbranch_vccz", branch),
        7 => ("s_cbranch_vccnz", branch),
        8 => ("s_cbranch_execz", branch),
        9 => ("s_cbranch_execnz", branch),
        10 => ("s_barrier", SoppOperand::None),
        12 => ("s_waitcnt", SoppOperand::Imm(imm)),
        13 => ("s_sethalt", SoppOperand::Imm(imm)),
        14 => ("s_sleep", SoppOperand::Imm(imm)),
        15 => ("s_setprio", SoppOperand::Imm(imm)),
        16 => ("s_sendmsg", SoppOperand::Imm(imm)),
        17 => ("s_sendmsghalt", SoppOperand::Imm(imm)),
        18 => ("s_trap", SoppOperand::Imm(imm)),
        19 => ("s_icache_inv", SoppOperand::None),
        20 => ("s_incperflevel", SoppOperand::Imm(imm)),
        21 => ("s_decperflevel", SoppOperand::Imm(imm)),
        22 => ("s_ttracedata", SoppOperand::None),
        _ => return None,
    })
}

fn decode_ds(word0: u32, word1: u32) -> Option<String> {
    let op = (word0 >> 18) & 0xff;
    let offset0 = word0 & 0xff;
    let offset1 = (word0 >> 8) & 0xff;
    let offset16 = word0 & 0xffff;
    let gds = (word0 >> 17) & 1 != 0;
    let addr = word1 & 0xff;
    let data0 = (word1 >> 8) & 0xff;
    let data1 = (word1 >> 16) & 0xff;
    let vdst = word1 >> 24;

    let mut text = match op {
        13 => format!("{:<16}v{}, v{}", "ds_write_b32", addr, data0),
        14 => format!("{:<16}v{}, v{}, v{}", "ds_write2_b32", addr, data0, data1),
        54 => format!("{:<16}v{}, v{}", "ds_read_b32", vdst, addr),
        55 => format!("{:<16}v[{}:{}], v{}", "ds_read2_b32", vdst, vdst + 1, addr),
        56 => format!(
            "{:<16}v[{}:{}], v{}",
            "ds_read2st64_b32",
            vdst,
            vdst + 1,
            addr
        ),
        _ => return None,
    };

    match op {
        14 | 55 | 56 => {
            if offset0 != 0 {
                text.push_str(&format!(" offset0:{offset0}"));
            }
            if offset1 != 0 {
                text.push_str(&format!(" offset1:{offset1}"));
            }
        }
        _ => {
            if offset16 != 0 {
                text.push_str(&format!(" offset:{offset16}"));
            }
        }
    }
    if gds {
        text.push_str(" gds");
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::super::emitter::FastOutputBuffer;
    use super::*;

    fn disassemble_words(words: &[u32], arch: GcnArch, flags: DisasmFlags) -> String {
        let emitter = IsaEmitter::new(FastOutputBuffer::new(256, Vec::new()), 0);
        let mut gcn = GcnDisassembler::new(emitter, arch, flags);
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        gcn.set_input(&bytes);
        gcn.before_disassemble();
        gcn.disassemble().unwrap();
        String::from_utf8(gcn.finish().unwrap()).unwrap()
    }

    #[test]
    fn backward_branch_into_an_instruction() {
        // ds_read2_b32 spans bytes 0..8; the branch at byte 8 targets byte 4
        let out = disassemble_words(
            &[0xd8dc2625, 0x37000006, 0xbf82fffe],
            GcnArch::Gcn10,
            DisasmFlags::DUMP_CODE | DisasmFlags::FLOAT_LITS,
        );
        assert_eq!(
            out,
            "        ds_read2_b32    v[55:56], v6 offset0:37 offset1:38\n\
             .L4_0=.-4\n\
             \x20       s_branch        .L4_0\n"
        );
    }

    #[test]
    fn forward_branch_to_the_end_of_code() {
        // s_branch +1 word over an s_nop, landing right after the last
        // instruction
        let out = disassemble_words(
            &[0xbf820001, 0xbf800000, 0xbf810000],
            GcnArch::Gcn10,
            DisasmFlags::DUMP_CODE,
        );
        assert_eq!(
            out,
            "        s_branch        .L8_0\n\
             \x20       s_nop           0x0\n\
             .L8_0:\n\
             \x20       s_endpgm\n"
        );
    }

    #[test]
    fn branch_beyond_the_code_is_reached_with_org() {
        let out = disassemble_words(&[0xbf820002], GcnArch::Gcn10, DisasmFlags::DUMP_CODE);
        assert_eq!(
            out,
            "        s_branch        .L12_0\n.org 0xc\n.L12_0:\n"
        );
    }

    #[test]
    fn undecoded_words_are_kept_as_data() {
        // a VOP3 encoding outside the decoded subset: both words stay data
        let out = disassemble_words(&[0xd2060100, 0x00020204], GcnArch::Gcn10, DisasmFlags::DUMP_CODE);
        assert_eq!(out, "        .int 0xd2060100, 0x00020204\n");
    }

    #[test]
    fn undecoded_runs_collapse_to_fill() {
        let out = disassemble_words(&[0x7e000000; 4], GcnArch::Gcn10, DisasmFlags::DUMP_CODE);
        assert_eq!(out, "        .fill 4, 4, 0x7e000000\n");
    }

    #[test]
    fn labels_split_data_runs() {
        // the branch target sits between the two undecoded words, so the
        // data dump stops there and the label prints at its boundary
        let out = disassemble_words(
            &[0xbf820001, 0x7e000000, 0x7e000000],
            GcnArch::Gcn10,
            DisasmFlags::DUMP_CODE,
        );
        assert_eq!(
            out,
            "        s_branch        .L8_0\n\
             \x20       .int 0x7e000000\n\
             .L8_0:\n\
             \x20       .int 0x7e000000\n"
        );
    }

    #[test]
    fn trailing_bytes_dump_as_data() {
        let emitter = IsaEmitter::new(FastOutputBuffer::new(256, Vec::new()), 0);
        let mut gcn = GcnDisassembler::new(emitter, GcnArch::Gcn10, DisasmFlags::DUMP_CODE);
        let mut bytes: Vec<u8> = 0xbf810000u32.to_le_bytes().to_vec();
        bytes.extend([0xde, 0xad]);
        gcn.set_input(&bytes);
        gcn.before_disassemble();
        gcn.disassemble().unwrap();
        let out = String::from_utf8(gcn.finish().unwrap()).unwrap();
        assert_eq!(out, "        s_endpgm\n        .byte 0xde, 0xad\n");
    }

    #[test]
    fn hex_code_flag_prefixes_the_encoding() {
        let out = disassemble_words(
            &[0xbf810000],
            GcnArch::Gcn10,
            DisasmFlags::DUMP_CODE | DisasmFlags::HEX_CODE,
        );
        assert_eq!(out, "        /*bf810000*/ s_endpgm\n");
    }

    #[test]
    fn literal_operands_keep_instruction_boundaries() {
        // s_mov_b32 s0, literal — the literal word must not be scanned as an
        // instruction (it would otherwise look like a branch)
        let out = disassemble_words(
            &[0xbe8003ff, 0xbf82fffe, 0xbf810000],
            GcnArch::Gcn10,
            DisasmFlags::DUMP_CODE,
        );
        // no labels were invented for the literal word
        assert!(!out.contains(".L"));
        assert!(out.ends_with("        s_endpgm\n"));
    }
}
