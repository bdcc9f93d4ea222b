use replay_dashboard_lib::config::RuntimeArgs;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match RuntimeArgs::from_env().normalize() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(error = %error, "invalid configuration");
            std::process::exit(2);
        }
    };

    if let Err(error) = replay_dashboard_lib::run(config).await {
        tracing::error!(error = %error, "replay dashboard failed");
        std::process::exit(1);
    }
}
