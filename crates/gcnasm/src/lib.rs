//! gcnasm — core library
//!
//! This crate implements the source-processing pipeline and disassembler
//! emission machinery of a toolchain for AMD GCN machine code. It is
//! designed to be embedded in tools and tests, and powers the `gcnasm`
//! command-line tool in the `gcnasm-driver` crate.
//!
//! The assembler side is organised as a stack of input filters, each
//! producing logical lines together with the bookkeeping needed to map any
//! column of a produced line back to its origin:
//!
//! - Stream reading and lexical normalisation: [`input::StreamInputFilter`]
//! - Macro/repetition recording and replay: [`macros`]
//! - The provenance graph and trail printer: [`source`]
//! - Directive-driven expansion over the filter stack: [`expand::LineExpander`]
//! - Diagnostics collection and rendering: [`diagnostics`]
//!
//! The disassembler side decodes raw GCN code and interleaves it with label
//! definitions, `.org` fills, and relocation-aware operands:
//!
//! - Label/relocation emission: [`disasm::IsaEmitter`]
//! - The GCN code walker: [`disasm::GcnDisassembler`]
//! - The raw-code driver: [`disasm::Disassembler`]
//!
//! Quick start
//! -----------
//! Expand a macro-using snippet into plain logical lines:
//!
//! ```rust
//! use gcnasm::{diagnostics::Diagnostics, expand::LineExpander};
//!
//! let src = ".macro twice x\nadd \\x, \\x\n.endm\ntwice v1\n";
//! let mut expander = LineExpander::from_str(src, "example.s");
//! let mut diags = Diagnostics::new();
//! let lines = expander.expand_all(&mut diags).unwrap();
//! assert_eq!(lines, ["add v1, v1"]);
//! assert!(diags.is_empty());
//! ```
//!
//! Disassemble a raw code blob:
//!
//! ```rust
//! use gcnasm::{
//!     GpuDeviceType,
//!     disasm::{DisasmFlags, Disassembler, RawCodeInput},
//! };
//!
//! let code = 0xbf810000u32.to_le_bytes().to_vec(); // s_endpgm
//! let input = RawCodeInput {
//!     device_type: GpuDeviceType::Pitcairn,
//!     code,
//! };
//! let mut disasm = Disassembler::new_rawcode(input, Vec::new(), DisasmFlags::DUMP_CODE);
//! disasm.disassemble().unwrap();
//! let text = String::from_utf8(disasm.into_output()).unwrap();
//! assert!(text.starts_with(".rawcode\n.gpu Pitcairn\n.text\n"));
//! ```
//!
//! Diagnostics
//! -----------
//! Filters report lexical problems through a [`diagnostics::DiagnosticSink`]
//! and keep going; fatal conditions (a missing include file, an I/O error)
//! propagate as errors up the filter stack. Every diagnostic carries a
//! [`source::SourcePos`], and rendering one walks the whole
//! include/macro/repetition trail that produced the offending line.

pub mod diagnostics;
pub mod disasm;
pub mod expand;
pub mod gpu;
pub mod input;
pub mod macros;
pub mod source;
mod text;

pub use crate::{
    diagnostics::{Diagnostic, DiagnosticSink, Diagnostics, Severity},
    expand::{ExpandError, LineExpander},
    gpu::{GcnArch, GpuDeviceType},
    input::{FilterKind, InputError, InputFilter, StreamInputFilter},
    source::{LineCol, LineTrans, SourcePos},
    text::Text,
};
