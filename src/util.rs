//! Shared helpers: env bootstrap, tracing, and the outbound HTTP client.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Load a `.env` file if one is present. Existing environment variables are
/// never overwritten.
pub fn load_env() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!("environment loaded from {}", path.display());
    }
}

/// Initialize the global tracing subscriber. `RUST_LOG` wins over the
/// configured level so operators can turn up verbosity without touching the
/// config file.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone());
    let builder = fmt().with_env_filter(EnvFilter::new(filter));
    // Ignore the error if a subscriber is already installed (tests).
    let _ = if logging.pretty {
        tracing::subscriber::set_global_default(builder.pretty().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
}

/// Build the shared outbound HTTP client. Timeouts are per request (each
/// provider carries its own), so none is set globally. Standard proxy
/// variables are honored by reqwest's default proxy support.
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("llmux/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Seconds since the Unix epoch; the timestamp stamped onto gateway-minted
/// responses.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
