use gateway_app::app::App;
use gateway_app::config::AppConfig;
use gateway_core::task::runner::Runner;
use std::env;
use std::process;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let debug = env::var("DEBUG_LOG").is_ok_and(|value| value == "true");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|e| {
        error!("CONFIG_PATH is not set: {}", e);
        process::exit(1);
    });

    let config = AppConfig::load(&config_path).unwrap_or_else(|e| {
        error!("{}", e);
        process::exit(1);
    });

    if let Err(e) = (App { config }).run().await {
        error!("{}", e);
        process::exit(1);
    }
}
