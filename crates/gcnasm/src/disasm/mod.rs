//! Disassembly back to assembler source text.
//!
//! The entry point is [`Disassembler`], which writes the dialect header and
//! hands each code section to the GCN walker in [`gcn`]. The label and
//! relocation plumbing lives in [`emitter`]; the helpers at the bottom dump
//! non-code payloads as `.byte`/`.int`/`.fill`/`.ascii` directives.

use std::io;

use crate::gpu::GpuDeviceType;

pub mod emitter;
pub mod gcn;

pub use emitter::{FastOutputBuffer, IsaEmitter, RelocKind, Relocation};
pub use gcn::GcnDisassembler;

bitflags::bitflags! {
    /// What the disassembler includes in its output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DisasmFlags: u32 {
        /// Emit `.text` sections with decoded instructions.
        const DUMP_CODE = 1;
        /// Annotate float-typed literal constants with their decimal value.
        const FLOAT_LITS = 2;
        /// Prefix every instruction with its encoding words.
        const HEX_CODE = 4;
    }
}

/// The container dialects assembler text can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Amd,
    AmdCl2,
    Gallium,
    RawCode,
}

impl BinaryFormat {
    /// The directive opening output for this dialect.
    pub fn directive(self) -> &'static str {
        match self {
            BinaryFormat::Amd => ".amd",
            BinaryFormat::AmdCl2 => ".amdcl2",
            BinaryFormat::Gallium => ".gallium",
            BinaryFormat::RawCode => ".rawcode",
        }
    }
}

/// A bare code blob with no container around it.
#[derive(Debug, Clone)]
pub struct RawCodeInput {
    pub device_type: GpuDeviceType,
    pub code: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DisasmError {
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Disassembles an input into vendor-compatible assembler text.
pub struct Disassembler<W: io::Write> {
    input: RawCodeInput,
    output: W,
    flags: DisasmFlags,
    section_count: u32,
}

impl<W: io::Write> Disassembler<W> {
    pub fn new_rawcode(input: RawCodeInput, output: W, flags: DisasmFlags) -> Disassembler<W> {
        Disassembler {
            input,
            output,
            flags,
            section_count: 0,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(gpu = %self.input.device_type))]
    pub fn disassemble(&mut self) -> Result<(), DisasmError> {
        use io::Write as _;
        writeln!(self.output, "{}", BinaryFormat::RawCode.directive())?;
        writeln!(self.output, ".gpu {}", self.input.device_type.name())?;

        if self.flags.contains(DisasmFlags::DUMP_CODE) {
            writeln!(self.output, ".text")?;
            let emitter = IsaEmitter::new(
                FastOutputBuffer::new(512, &mut self.output),
                self.section_count,
            );
            let mut gcn =
                GcnDisassembler::new(emitter, self.input.device_type.arch(), self.flags);
            gcn.set_input(&self.input.code);
            gcn.before_disassemble();
            gcn.disassemble()?;
            gcn.finish()?;
            self.section_count += 1;
        }
        self.output.flush()?;
        Ok(())
    }

    pub fn into_output(self) -> W {
        self.output
    }
}

/// Dump raw bytes as `.byte` lines of eight, collapsing long runs of one
/// value into `.fill`.
pub fn print_disasm_data<W: io::Write>(
    data: &[u8],
    output: &mut W,
    second_align: bool,
) -> io::Result<()> {
    let line_prefix = if second_align {
        "        .byte "
    } else {
        "    .byte "
    };
    let fill_prefix = if second_align {
        "        .fill "
    } else {
        "    .fill "
    };
    let mut p = 0;
    while p < data.len() {
        let mut fill_end = p + 1;
        while fill_end < data.len() && data[fill_end] == data[p] {
            fill_end += 1;
        }
        if fill_end >= p + 8 {
            // the run covers at least one whole line
            let old_p = p;
            p = if fill_end != data.len() {
                fill_end & !7
            } else {
                fill_end
            };
            writeln!(output, "{}{}, 1, 0x{:02x}", fill_prefix, p - old_p, data[old_p])?;
            continue;
        }

        let line_end = (p + 8).min(data.len());
        output.write_all(line_prefix.as_bytes())?;
        while p < line_end {
            write!(output, "0x{:02x}", data[p])?;
            p += 1;
            if p < line_end {
                output.write_all(b", ")?;
            }
        }
        output.write_all(b"\n")?;
    }
    Ok(())
}

/// Dump 32-bit words as `.int` lines of four, collapsing runs into `.fill`.
pub fn print_disasm_data_u32<W: io::Write>(
    data: &[u32],
    output: &mut W,
    second_align: bool,
) -> io::Result<()> {
    let line_prefix = if second_align {
        "        .int "
    } else {
        "    .int "
    };
    let fill_prefix = if second_align {
        "        .fill "
    } else {
        "    .fill "
    };
    let mut p = 0;
    while p < data.len() {
        let mut fill_end = p + 1;
        while fill_end < data.len() && data[fill_end] == data[p] {
            fill_end += 1;
        }
        if fill_end >= p + 4 {
            let old_p = p;
            p = if fill_end != data.len() {
                fill_end & !3
            } else {
                fill_end
            };
            writeln!(
                output,
                "{}{}, 4, 0x{:08x}",
                fill_prefix,
                p - old_p,
                data[old_p]
            )?;
            continue;
        }

        let line_end = (p + 4).min(data.len());
        output.write_all(line_prefix.as_bytes())?;
        while p < line_end {
            write!(output, "0x{:08x}", data[p])?;
            p += 1;
            if p < line_end {
                output.write_all(b", ")?;
            }
        }
        output.write_all(b"\n")?;
    }
    Ok(())
}

/// Dump a long character payload as `.ascii` lines, splitting after embedded
/// newlines and capping the escaped output per line.
pub fn print_disasm_long_string<W: io::Write>(
    data: &[u8],
    output: &mut W,
    second_align: bool,
) -> io::Result<()> {
    let prefix = if second_align {
        "        .ascii \""
    } else {
        "    .ascii \""
    };
    let mut pos = 0;
    while pos < data.len() {
        let end = (pos + 72).min(data.len());
        let mut line_end = pos;
        while line_end < end && data[line_end] != b'\n' {
            line_end += 1;
        }
        if line_end < end {
            line_end += 1; // take the newline with it
        }
        let (escaped, consumed) = escape_c_style(&data[pos..line_end], 76);
        pos += consumed;
        writeln!(output, "{prefix}{escaped}\"")?;
    }
    Ok(())
}

/// C-style escaping bounded by an output budget; returns the escaped text
/// and how many input bytes it covers.
fn escape_c_style(data: &[u8], max_out: usize) -> (String, usize) {
    let mut out = String::new();
    let mut consumed = 0;
    for &b in data {
        let escaped: String = match b {
            b'\\' => "\\\\".to_owned(),
            b'"' => "\\\"".to_owned(),
            b'\n' => "\\n".to_owned(),
            b'\t' => "\\t".to_owned(),
            b'\r' => "\\r".to_owned(),
            0x07 => "\\a".to_owned(),
            0x08 => "\\b".to_owned(),
            0x0b => "\\v".to_owned(),
            0x0c => "\\f".to_owned(),
            0x20..=0x7e => (b as char).to_string(),
            _ => format!("\\{b:03o}"),
        };
        if out.len() + escaped.len() > max_out {
            break;
        }
        out.push_str(&escaped);
        consumed += 1;
    }
    (out, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(data: &[u8]) -> String {
        let mut out = Vec::new();
        print_disasm_data(data, &mut out, false).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn rawcode_header_and_code() {
        let code: Vec<u8> = [0xd8dc2625u32, 0x37000006, 0xbf82fffe]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let mut disasm = Disassembler::new_rawcode(
            RawCodeInput {
                device_type: GpuDeviceType::Pitcairn,
                code,
            },
            Vec::new(),
            DisasmFlags::DUMP_CODE | DisasmFlags::FLOAT_LITS,
        );
        disasm.disassemble().unwrap();
        let out = String::from_utf8(disasm.into_output()).unwrap();

        assert_eq!(
            out,
            ".rawcode\n\
             .gpu Pitcairn\n\
             .text\n\
             \x20       ds_read2_b32    v[55:56], v6 offset0:37 offset1:38\n\
             .L4_0=.-4\n\
             \x20       s_branch        .L4_0\n"
        );
    }

    #[test]
    fn without_dump_code_only_the_header_appears() {
        let mut disasm = Disassembler::new_rawcode(
            RawCodeInput {
                device_type: GpuDeviceType::Hawaii,
                code: vec![0; 8],
            },
            Vec::new(),
            DisasmFlags::empty(),
        );
        disasm.disassemble().unwrap();
        let out = String::from_utf8(disasm.into_output()).unwrap();
        assert_eq!(out, ".rawcode\n.gpu Hawaii\n");
    }

    #[test]
    fn dialect_directives() {
        assert_eq!(BinaryFormat::Amd.directive(), ".amd");
        assert_eq!(BinaryFormat::AmdCl2.directive(), ".amdcl2");
        assert_eq!(BinaryFormat::Gallium.directive(), ".gallium");
        assert_eq!(BinaryFormat::RawCode.directive(), ".rawcode");
    }

    #[test]
    fn byte_dump_groups_eight_per_line() {
        let data: Vec<u8> = (1..=10).collect();
        assert_eq!(
            dump(&data),
            "    .byte 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08\n\
             \x20   .byte 0x09, 0x0a\n"
        );
    }

    #[test]
    fn long_runs_become_fill() {
        assert_eq!(dump(&[0u8; 16]), "    .fill 16, 1, 0x00\n");
    }

    #[test]
    fn runs_are_cut_at_the_line_group_boundary() {
        let mut data = vec![5u8; 12];
        data.extend([1, 2, 3, 4]);
        assert_eq!(
            dump(&data),
            "    .fill 8, 1, 0x05\n\
             \x20   .byte 0x05, 0x05, 0x05, 0x05, 0x01, 0x02, 0x03, 0x04\n"
        );
    }

    #[test]
    fn word_dump_groups_four_per_line() {
        let mut out = Vec::new();
        print_disasm_data_u32(&[0xdeadbeef, 1, 2], &mut out, true).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "        .int 0xdeadbeef, 0x00000001, 0x00000002\n"
        );
    }

    #[test]
    fn word_runs_become_fill() {
        let mut out = Vec::new();
        print_disasm_data_u32(&[7; 4], &mut out, false).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "    .fill 4, 4, 0x00000007\n");
    }

    #[test]
    fn ascii_dump_splits_after_newlines() {
        let mut out = Vec::new();
        print_disasm_long_string(b"Hello\nWorld", &mut out, false).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "    .ascii \"Hello\\n\"\n    .ascii \"World\"\n"
        );
    }

    #[test]
    fn ascii_dump_escapes_specials() {
        let mut out = Vec::new();
        print_disasm_long_string(b"a\"b\\c\x01", &mut out, false).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "    .ascii \"a\\\"b\\\\c\\001\"\n"
        );
    }
}
