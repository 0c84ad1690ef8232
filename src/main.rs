use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("locked_in=info")),
        )
        .init();

    if let Err(error) = locked_in::run().await {
        tracing::error!(error = %error, "locked-in stopped");
        std::process::exit(1);
    }
}
