use std::path::PathBuf;

use actix_web::{web, App, HttpServer};
use tracing::info;

use llmux::config::GatewayConfig;
use llmux::server::{build_state, config_routes};
use llmux::util::{init_tracing, load_env};

/// Config path resolution: `--config <path>` beats `LLMUX_CONFIG` beats
/// `llmux.yaml` in the working directory.
fn config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    if let Ok(path) = std::env::var("LLMUX_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("llmux.yaml")
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    load_env();

    let config = GatewayConfig::load(&config_path())?;
    init_tracing(&config.logging);

    let state = build_state(&config).await?;
    let bind_addr = (config.server.host.clone(), config.server.port);
    info!(
        host = %config.server.host,
        port = config.server.port,
        providers = state.registry.len(),
        "llmux listening"
    );

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(actix_cors::Cors::permissive())
            .configure(config_routes)
    })
    .bind(bind_addr)?
    .run()
    .await?;

    Ok(())
}
