#[tokio::main]
async fn main() -> anyhow::Result<()> {
  neochat::run().await
}
