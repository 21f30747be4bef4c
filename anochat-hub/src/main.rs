use anochat_hub::service::ApplicationBootstrap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ApplicationBootstrap::run().await?;
    Ok(())
}
