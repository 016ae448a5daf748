use std::path::Path;

use anyhow::Context;
use libtest_mimic::Arguments;

fn main() -> anyhow::Result<()> {
    let args = Arguments::from_args();

    let case_root = Path::new(env!("CARGO_MANIFEST_DIR")).join("cases");
    let trials = integration_tests::discover(&case_root)
        .context("failed to discover test cases")?
        .into_iter()
        .map(|case| case.trial())
        .collect();

    libtest_mimic::run(&args, trials).exit()
}
