//! searcherd - prompt dispatch service for browser-automation search workers.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use searcherd::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "searcherd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    searcherd::server::serve(settings).await
}
