//! Introibrotech background removal API server

use introibrotech_bg_remover::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}
