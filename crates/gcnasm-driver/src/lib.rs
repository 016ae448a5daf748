//! gcnasm — command-line driver
//!
//! This crate provides the command-line interface for the `gcnasm`
//! toolchain. It wires the core stages from the `gcnasm` crate to files and
//! standard streams, sets up logging, and maps diagnostics and errors to
//! exit codes: `0` on success, `1` on failure.
//!
//! Two subcommands are exposed:
//!
//! - `gcnasm expand` runs the source-processing pipeline (includes, macros,
//!   repetitions) and prints the resulting logical lines.
//! - `gcnasm disasm` disassembles raw GCN machine code for a given device.

mod cli;

pub use crate::cli::main;
