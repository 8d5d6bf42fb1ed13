/**
 * HYDROLOOP KERNEL - Point d'entrée du service de livraison de commandes
 *
 * RÔLE : Bootstrap : config, store, gateway, breaker, tracker, bus, listener
 * MQTT des réponses devices, API statut HTTP.
 *
 * ARCHITECTURE : Les contrôleurs de correction publient via le CommandBus ;
 * les réponses arrivent par MQTT (ou POST /commands/{id}/status) et
 * terminent les commandes suivies.
 */

use anyhow::Context;
use hydroloop_kernel::bus::{BusSettings, CommandBus};
use hydroloop_kernel::circuit_breaker::{BreakerSettings, CircuitBreaker};
use hydroloop_kernel::config::load_config;
use hydroloop_kernel::health::HealthTracker;
use hydroloop_kernel::http::{self, AppState};
use hydroloop_kernel::mqtt;
use hydroloop_kernel::ports::FileStore;
use hydroloop_kernel::tracker::CommandTracker;
use hydroloop_kernel::transport::HttpGateway;
use hydroloop_kernel::validator::CommandValidator;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hydroloop_kernel=info")),
        )
        .with_target(false)
        .init();

    let cfg = load_config().await;

    let store = Arc::new(
        FileStore::open(&cfg.data_dir)
            .with_context(|| format!("failed to open store in {}", cfg.data_dir.display()))?,
    );
    let gateway = HttpGateway::new(&cfg.gateway).context("failed to build gateway client")?;
    tracing::info!(endpoint = gateway.endpoint(), greenhouse = %cfg.greenhouse_uid, "gateway transport ready");

    let tracker = CommandTracker::new(store.clone(), store.clone(), cfg.tracker.command_timeout());

    let mut bus = CommandBus::new(
        BusSettings::from_config(&cfg),
        store.clone(),
        store.clone(),
        Arc::new(gateway),
        tracker.clone(),
        CommandValidator::new(cfg.validator.clone()),
    );
    if cfg.breaker.enabled {
        let breaker = CircuitBreaker::new(cfg.breaker.name.clone(), BreakerSettings::from(&cfg.breaker));
        bus = bus.with_breaker(Arc::new(breaker));
    } else {
        tracing::warn!("circuit breaker disabled");
    }
    let bus = Arc::new(bus);

    let health = HealthTracker::new();

    // réponses devices → tracker
    match cfg.mqtt.clone() {
        Some(mqtt_conf) => {
            tracing::info!(host = %mqtt_conf.host, topic = %mqtt_conf.response_topic, "starting MQTT response listener");
            mqtt::spawn_response_listener(mqtt_conf, tracker, health.clone());
        }
        None => tracing::warn!("no mqtt section, device responses only via HTTP"),
    }

    let app_state = AppState {
        bus,
        health,
        api_key: cfg.http.api_key.clone(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    tracing::info!(addr = %cfg.http.bind, "listening");
    axum::serve(listener, app).await.context("http server stopped")?;
    Ok(())
}
