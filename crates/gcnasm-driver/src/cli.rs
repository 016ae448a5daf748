use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Parser;
use gcnasm::{
    GpuDeviceType, LineExpander,
    diagnostics::Diagnostics,
    disasm::{DisasmFlags, Disassembler, RawCodeInput},
};
use tracing_subscriber::EnvFilter;

const LOG_FILTERS: &[&str] = &["warn", "gcnasm=debug", "gcnasm_driver=debug"];

/// A `main()` function that parses the command line arguments and runs the
/// toolchain.
#[doc(hidden)]
pub fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| LOG_FILTERS.join(",").parse().unwrap());

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .init();

    cli.run()
}

/// The GCN assembler toolchain.
#[derive(Debug, Parser)]
#[clap(version, about, author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Expand includes, macros, and repetitions, printing the resulting
    /// logical lines.
    Expand(ExpandArgs),
    /// Disassemble raw GCN machine code.
    Disasm(DisasmArgs),
}

#[derive(Debug, clap::Args)]
struct ExpandArgs {
    /// The source file to expand; `-` reads standard input.
    input: PathBuf,
    /// Write the expanded lines here instead of standard output.
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Extra directories searched by `.include`.
    #[clap(short = 'I', long = "include-dir")]
    include_dirs: Vec<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct DisasmArgs {
    /// The raw machine-code file to disassemble.
    input: PathBuf,
    /// The GPU device type to decode for.
    #[clap(short, long, env = "GCNASM_GPU")]
    gpu: String,
    /// Write the assembler text here instead of standard output.
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Skip the `.text` section; only emit the header.
    #[clap(long)]
    no_code: bool,
    /// Annotate float-typed literal constants.
    #[clap(long)]
    float_lits: bool,
    /// Prefix instructions with their encoding words.
    #[clap(long)]
    hex_code: bool,
}

impl Cli {
    fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Expand(args) => run_expand(args),
            Command::Disasm(args) => run_disasm(args),
        }
    }
}

#[tracing::instrument(level = "info", skip_all, fields(input = %args.input.display()))]
fn run_expand(args: ExpandArgs) -> anyhow::Result<()> {
    let mut expander = if args.input == Path::new("-") {
        LineExpander::from_stream(io::stdin(), "")
    } else {
        LineExpander::from_file(&args.input)
            .with_context(|| format!("failed to open {}", args.input.display()))?
    };
    for dir in args.include_dirs {
        expander.add_include_dir(dir);
    }

    let mut diags = Diagnostics::new();
    let lines = expander.expand_all(&mut diags);
    eprint!("{}", diags.render_to_string());
    let lines = lines?;

    let mut out = open_output(args.output.as_deref())?;
    for line in &lines {
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    if diags.has_errors() {
        anyhow::bail!("expansion failed");
    }
    Ok(())
}

#[tracing::instrument(level = "info", skip_all, fields(input = %args.input.display(), gpu = %args.gpu))]
fn run_disasm(args: DisasmArgs) -> anyhow::Result<()> {
    let gpu: GpuDeviceType = args.gpu.parse()?;
    let code = fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let mut flags = DisasmFlags::DUMP_CODE;
    if args.no_code {
        flags.remove(DisasmFlags::DUMP_CODE);
    }
    if args.float_lits {
        flags |= DisasmFlags::FLOAT_LITS;
    }
    if args.hex_code {
        flags |= DisasmFlags::HEX_CODE;
    }

    let out = open_output(args.output.as_deref())?;
    let mut disasm = Disassembler::new_rawcode(
        RawCodeInput {
            device_type: gpu,
            code,
        },
        out,
        flags,
    );
    disasm.disassemble()?;
    Ok(())
}

fn open_output(path: Option<&Path>) -> anyhow::Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Box::new(io::BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout().lock())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_both_subcommands() {
        let cli = Cli::parse_from(["gcnasm", "expand", "kernel.s", "-I", "lib"]);
        match cli.command {
            Command::Expand(args) => {
                assert_eq!(args.input, PathBuf::from("kernel.s"));
                assert_eq!(args.include_dirs, [PathBuf::from("lib")]);
            }
            other => panic!("expected expand, got {other:?}"),
        }

        let cli = Cli::parse_from(["gcnasm", "disasm", "code.bin", "--gpu", "pitcairn", "--hex-code"]);
        match cli.command {
            Command::Disasm(args) => {
                assert_eq!(args.gpu, "pitcairn");
                assert!(args.hex_code);
                assert!(!args.float_lits);
            }
            other => panic!("expected disasm, got {other:?}"),
        }
    }

    #[test]
    fn expand_writes_the_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.s");
        let output = dir.path().join("out.s");
        fs::write(&input, ".rept 2\nv_nop\n.endr\n").unwrap();

        run_expand(ExpandArgs {
            input: input.clone(),
            output: Some(output.clone()),
            include_dirs: Vec::new(),
        })
        .unwrap();

        assert_eq!(fs::read_to_string(&output).unwrap(), "v_nop\nv_nop\n");
    }

    #[test]
    fn disasm_writes_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("code.bin");
        let output = dir.path().join("code.s");
        fs::write(&input, 0xbf810000u32.to_le_bytes()).unwrap();

        run_disasm(DisasmArgs {
            input,
            gpu: "tahiti".into(),
            output: Some(output.clone()),
            no_code: false,
            float_lits: false,
            hex_code: false,
        })
        .unwrap();

        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            ".rawcode\n.gpu Tahiti\n.text\n        s_endpgm\n"
        );
    }

    #[test]
    fn unknown_gpu_device_fails() {
        let err = run_disasm(DisasmArgs {
            input: PathBuf::from("code.bin"),
            gpu: "polaris".into(),
            output: None,
            no_code: false,
            float_lits: false,
            hex_code: false,
        })
        .unwrap_err();

        assert!(err.to_string().contains("unknown GPU device type"));
    }
}
