/**
 * ATG SIMULATOR - Point d'entrée du serveur de simulation
 *
 * RÔLE : Bootstrap : .env, logging, config, simulateur, API HTTP.
 * Ctrl+C arrête proprement la simulation (déconnexion broker) avant de
 * fermer le serveur.
 *
 * ARCHITECTURE : API REST → Simulator (état partagé) → boucle de tick → MQTT.
 */

mod config;
mod errors;
mod history;
mod http;
mod models;
mod mqtt;
mod registry;
mod scheduler;
mod simulator;
mod state;
mod variation;

use crate::config::load_settings;
use crate::http::AppState;
use crate::mqtt::MqttConnector;
use crate::simulator::Simulator;
use crate::state::Phase;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("atg_simulator=info")),
        )
        .init();

    let settings = load_settings().await;

    let connector = Arc::new(MqttConnector::new(Duration::from_secs(
        settings.simulation.connect_timeout_secs,
    )));
    let simulator = Simulator::new(&settings, connector);

    let app = http::build_router(AppState { simulator: simulator.clone() });

    let addr = format!("{}:{}", settings.http.bind, settings.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("ATG simulator listening on http://{addr}");
    info!(
        "default broker {}:{}",
        settings.broker.broker_ip, settings.broker.broker_port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("shutting down server...");
    if simulator.phase() != Phase::Stopped {
        simulator.stop().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}
