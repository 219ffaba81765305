// src/main.rs
mod api;
mod auth;
mod config;
mod db;
mod error;
mod models;
mod money;
mod quotes;
mod trade;

use crate::api::AppState;
use crate::auth::Sessions;
use crate::config::Config;
use crate::quotes::AlphaVantage;
use env_logger::{Builder, Env};
use log::{error, info};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match db::init(&config.database).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };
    info!("Connected to database...");

    let client = match Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        pool: pool.clone(),
        quotes: Arc::new(AlphaVantage::new(
            client,
            config.quote_base_url.clone(),
            config.api_key.clone(),
        )),
        sessions: Arc::new(Sessions::new(
            config.secret_key.clone(),
            config.session_ttl_secs,
        )),
        starting_cash: config.starting_cash,
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    };
    let (addr, server) = match warp::serve(api::routes(state))
        .try_bind_with_graceful_shutdown(config.bind_addr, shutdown)
    {
        Ok(bound) => bound,
        Err(e) => {
            error!("Failed to bind {}: {}", config.bind_addr, e);
            std::process::exit(1);
        }
    };
    info!("Server running on http://{}", addr);
    server.await;

    pool.close().await;
    info!("Shut down cleanly");
}
