use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tugger::config::Config;
use tugger::notify::Notifier;
use tugger::pipeline::Pipeline;
use tugger::registry::HttpRegistry;
use tugger::{Error, server};

fn init_tracing(level: &str) -> tugger::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|_| Error::LogLevel(level.to_string()))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> tugger::Result<()> {
    let config = Config::parse();
    init_tracing(&config.log_level)?;

    let policy = config.image_policy()?;
    let registry = HttpRegistry::new(config.registry_timeout(), config.registry_credentials())?;
    let notifier = Notifier::new(&config.notifier_config())?;

    let pipeline = Pipeline::new(
        config.pipeline_settings(),
        policy,
        Arc::new(registry),
        Arc::new(notifier),
    );

    server::run(&config, Arc::new(pipeline)).await
}
