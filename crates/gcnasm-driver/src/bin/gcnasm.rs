fn main() -> anyhow::Result<()> {
    gcnasm_driver::main()
}
