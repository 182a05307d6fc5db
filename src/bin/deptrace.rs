use anyhow::Result;

fn main() -> Result<()> {
    deptrace::cli::run()
}
