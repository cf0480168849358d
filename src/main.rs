#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = lernwerk::run().await {
        eprintln!("lernwerk fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
