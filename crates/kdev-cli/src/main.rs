fn main() -> anyhow::Result<()> {
    kdev_cli::run()
}
