//! Fixture-driven end-to-end tests.
//!
//! Every directory under `cases/` is one test case. A case holds either an
//! `input.asm` (run through the line expander) or an `input.hex` (raw GCN
//! code, disassembled), plus an `expected.out` with the exact output.
//!
//! The first line of an `input.hex` names the device and any flags
//! (`float-lits`, `hex-code`, `no-code`); the remaining lines are
//! whitespace-separated hexadecimal code words.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use gcnasm::{
    GpuDeviceType,
    diagnostics::Diagnostics,
    disasm::{DisasmFlags, Disassembler, RawCodeInput},
    expand::LineExpander,
};
use libtest_mimic::{Failed, Trial};

pub struct TestCase {
    pub name: String,
    dir: PathBuf,
    kind: CaseKind,
}

enum CaseKind {
    Expand,
    Disasm,
}

pub fn discover(root: &Path) -> anyhow::Result<Vec<TestCase>> {
    let mut cases = Vec::new();
    for entry in
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?
    {
        let entry = entry?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let kind = if dir.join("input.asm").exists() {
            CaseKind::Expand
        } else if dir.join("input.hex").exists() {
            CaseKind::Disasm
        } else {
            continue;
        };
        cases.push(TestCase { name, dir, kind });
    }
    cases.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(cases)
}

impl TestCase {
    pub fn trial(self) -> Trial {
        Trial::test(self.name.clone(), move || self.run())
    }

    fn run(&self) -> Result<(), Failed> {
        let expected = fs::read_to_string(self.dir.join("expected.out"))
            .map_err(|e| Failed::from(format!("missing expected.out: {e}")))?;
        let actual = match self.kind {
            CaseKind::Expand => expand_case(&self.dir)?,
            CaseKind::Disasm => disasm_case(&self.dir)?,
        };
        if actual != expected {
            return Err(format!(
                "output mismatch\n--- expected ---\n{expected}--- actual ---\n{actual}"
            )
            .into());
        }
        Ok(())
    }
}

fn expand_case(dir: &Path) -> Result<String, Failed> {
    let mut expander =
        LineExpander::from_file(dir.join("input.asm")).map_err(|e| Failed::from(e.to_string()))?;
    let mut diags = Diagnostics::new();
    let lines = expander
        .expand_all(&mut diags)
        .map_err(|e| Failed::from(e.to_string()))?;
    if !diags.is_empty() {
        return Err(format!("unexpected diagnostics:\n{}", diags.render_to_string()).into());
    }
    let mut out = String::new();
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn disasm_case(dir: &Path) -> Result<String, Failed> {
    let text =
        fs::read_to_string(dir.join("input.hex")).map_err(|e| Failed::from(e.to_string()))?;
    let mut lines = text.lines();
    let header = lines.next().ok_or_else(|| Failed::from("empty input.hex"))?;
    let mut parts = header.split_whitespace();
    let gpu: GpuDeviceType = parts
        .next()
        .ok_or_else(|| Failed::from("missing device name"))?
        .parse()
        .map_err(|e: gcnasm::gpu::UnknownGpuDevice| Failed::from(e.to_string()))?;

    let mut flags = DisasmFlags::DUMP_CODE;
    for token in parts {
        match token {
            "float-lits" => flags |= DisasmFlags::FLOAT_LITS,
            "hex-code" => flags |= DisasmFlags::HEX_CODE,
            "no-code" => flags.remove(DisasmFlags::DUMP_CODE),
            other => return Err(format!("unknown flag '{other}'").into()),
        }
    }

    let mut code = Vec::new();
    for word in lines.flat_map(|l| l.split_whitespace()) {
        let word = u32::from_str_radix(word, 16)
            .map_err(|e| Failed::from(format!("bad code word '{word}': {e}")))?;
        code.extend(word.to_le_bytes());
    }

    let mut disasm = Disassembler::new_rawcode(
        RawCodeInput {
            device_type: gpu,
            code,
        },
        Vec::new(),
        flags,
    );
    disasm
        .disassemble()
        .map_err(|e| Failed::from(e.to_string()))?;
    String::from_utf8(disasm.into_output()).map_err(|e| Failed::from(e.to_string()))
}
