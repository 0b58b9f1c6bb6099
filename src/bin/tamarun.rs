use anyhow::Result;

fn main() -> Result<()> {
    tamarun::cli::run()
}
