use std::process::ExitCode;

use rexrender::WorkerExit;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::WorkerConfig;
use renderer::CommandRenderer;

mod config;
mod renderer;

const LOG_FORMAT: &str = "LOG_FORMAT";

#[tokio::main]
pub async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(?error, "Invalid configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(host = %config.host, program = %config.program, "Starting command worker");

    let renderer = CommandRenderer::new(config.program, config.args);
    match rexrender_http::start(&config.host, config.secret.as_deref(), config.settings, renderer)
        .await
    {
        Ok(WorkerExit::Deactivated) => {
            tracing::info!("Worker deactivated");
            ExitCode::SUCCESS
        }
        Ok(WorkerExit::Interrupted) => {
            tracing::info!("Worker interrupted, current job returned to the queue");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(?error, "Worker failed: {error}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let use_json = std::env::var(LOG_FORMAT)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}
