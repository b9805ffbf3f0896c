use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::sync::Arc;

use tripchat::api;
use tripchat::assistant::TripAssistant;
use tripchat::context::{ContextStore, SystemClock};
use tripchat::settings::Settings;

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::load()?;

    let store = Arc::new(ContextStore::new(
        Arc::new(SystemClock),
        chrono::Duration::seconds(settings.context.idle_timeout_secs),
        std::time::Duration::from_secs(settings.context.sweep_interval_secs),
    ));
    store.start();

    let assistant = web::Data::new(TripAssistant::from_settings(&settings, store.clone())?);

    let host = settings.server.host.clone();
    let port = settings.server.port;
    log::info!("Starting trip assistant at http://{}:{}", host, port);
    HttpServer::new(move || {
        App::new()
            .app_data(assistant.clone())
            .configure(api::configure)
    })
    .bind((host, port))?
    .run()
    .await?;

    store.stop();
    Ok(())
}
