//! RTG operations backend: identity, authorization table and the client bundle

use std::io::read_to_string;

use actix_web::{App, HttpServer};
use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_actix_web::TracingLogger;

use crate::config::{Config, LogFormat};
use crate::model::Model;
use crate::opt::{Command, Opt};
use crate::service::assets::Assets;

mod access;
mod admin;
mod config;
pub mod model;
mod mutation;
mod opt;
mod query;
mod service;

/// Initializes tracing collection
fn setup_tracing(config: config::Logging) -> Result<()> {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let fmt_layer = match config.format {
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let filter_layer = config
        .filters
        .into_iter()
        .fold(filter_layer, |layer, filter| layer.add_directive(filter));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();

    Ok(())
}

async fn serve(config: Config, model: Model) -> Result<()> {
    let assets = config.static_dir.map(Assets::new);
    let service_config = service::configure(config.graphiql, model, assets).await?;

    info!(host = %config.host, "Starting HTTP service");
    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .configure(service_config.clone())
    })
    .bind(config.host)?
    .run()
    .await?;

    info!("Service stopped, tearing down");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Opt {
        config: mut config_file,
        command,
    } = Opt::parse();

    let config = read_to_string(&mut config_file)?;
    let config: Config = toml::from_str(&config)?;

    setup_tracing(config.logging.clone())?;
    color_eyre::install()?;

    info!(
        config = ?config_file.path().path(),
        "Tracing initialized, setting up a service"
    );

    let model = Model::with_config(config.db.clone(), config.tokens).await?;
    model.cleanup().await?;

    match command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, model).await?,
        Command::Seed { file } => {
            let seed = read_to_string(file)?;
            let count = admin::seed(&model, toml::from_str(&seed)?).await?;
            info!(count, "Users seeded");
        }
        Command::Inspect => admin::inspect(&model, &mut std::io::stdout().lock()).await?,
        Command::SetRole { email, role } => {
            admin::set_role(&model, &email, role).await?;
        }
    }

    Ok(())
}
