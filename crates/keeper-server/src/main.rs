//! Main entry point for the keeper server.
//!
//! Startup order matters: storage first, then the domain books, then the
//! presence lease and the watch/monitor/janitor loops, then the registry
//! and the three listeners (node RPC, stream RPC, admin HTTP).

use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use tokio::sync::mpsc;
use tracing::info;

use keeper_core::{Engine, NodeMetrics};
use keeper_registry::grpc::DiscoveryService;
use keeper_registry::registry::Registry;
use keeper_registry::service_book::SessionPush;
use keeper_registry::{ServiceBook, SessionBook, etcd::EtcdRegistry};
use keeper_server::api::transit::TransitClient;
use keeper_server::settings::Settings;
use keeper_server::{api, metrics, startup};
use keeper_storage::KeeperStore;
use keeper_storage::store::EVENT_CHAN_SIZE;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    let _log_guard = startup::init_logging(&settings.log_path, true);
    info!(
        "keeper {} starting, rpc {}, admin {}",
        settings.keeper_id, settings.keeper_rpc_addr, settings.keeper_admin_addr
    );

    let store = KeeperStore::new(
        &settings.storage_url,
        &settings.storage_username,
        &settings.storage_password,
    )
    .await?;

    let node_metrics: Arc<dyn NodeMetrics> = Arc::new(metrics::PromMetrics);
    let engine = Engine::new(
        Arc::clone(&store),
        node_metrics,
        settings.keeper_rpc_addr.clone(),
        settings.keeper_admin_addr.clone(),
        settings.event_interval,
    );
    let domain_names = engine.load_domains().await?;
    info!("loaded {} domains", domain_names.len());
    keeper_config::bootstrap::import_init_domains(
        &store,
        &settings.tmp_path.join("init"),
        &domain_names,
    )
    .await;

    // keeper presence lease
    {
        let store = Arc::clone(&store);
        let keeper_id = settings.keeper_id;
        let admin_addr = settings.keeper_admin_addr.clone();
        tokio::spawn(async move { store.keep_alive(keeper_id, admin_addr).await });
    }

    // storage watch feeds the engine
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHAN_SIZE);
    {
        let store = Arc::clone(&store);
        let mode = settings.event_mode;
        tokio::spawn(async move { store.watch(mode, event_tx).await });
    }
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run_watch(event_rx).await });
    }
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run_monitor().await });
    }

    // periodic reconciliation (one keeper wins the leader lease per pass)
    {
        let store = Arc::clone(&store);
        let period = settings.reconcile_interval;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                store.run_reconcile().await;
            }
        });
    }

    // service registry
    let registry: Arc<dyn Registry> = EtcdRegistry::connect(
        &settings.registry_url,
        &settings.registry_username,
        &settings.registry_password,
    )
    .await?;
    let sessions = SessionBook::new();
    let services = ServiceBook::new(registry);
    services.load().await?;
    let registry_events = services.registry().watch().await?;
    services.spawn_watch(registry_events, Arc::clone(&sessions) as Arc<dyn SessionPush>);

    // listeners
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let node_server = startup::spawn_node_server(
        Settings::bind_addr(&settings.gorpc_listen)?,
        Arc::clone(&engine),
        shutdown_rx.clone(),
    );
    let stream_server = startup::spawn_stream_server(
        Settings::bind_addr(&settings.grpc_listen)?,
        Arc::clone(&engine),
        DiscoveryService::new(Arc::clone(&services), Arc::clone(&sessions)),
        shutdown_rx,
    );
    let metrics_server = metrics::serve(Settings::bind_addr(&settings.prom_listen)?)?;

    let admin_bind = Settings::bind_addr(&settings.admin_listen)?;
    let state = web::Data::new(api::AppState {
        engine: Arc::clone(&engine),
        services: Arc::clone(&services),
        settings: settings.clone(),
        transit: TransitClient::new(),
    });
    let admin_server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::routes)
    })
    .bind(admin_bind)?
    .run();

    info!("start finish");
    tokio::select! {
        result = admin_server => { result?; }
        result = metrics_server => { result?; }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining streams");
        }
    }
    let _ = shutdown_tx.send(true);
    let _ = node_server.await;
    let _ = stream_server.await;
    Ok(())
}
