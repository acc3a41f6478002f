use gametap::Proxy;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> gametap::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let proxy = Proxy::new()?;
    proxy.run().await
}
