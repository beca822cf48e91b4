use std::sync::Arc;

use ivr_orchestrator::action_engine::ActionEngine;
use ivr_orchestrator::call_store::CallStore;
use ivr_orchestrator::catalog::HttpCampaignCatalog;
use ivr_orchestrator::channel::ChannelRegistry;
use ivr_orchestrator::config::Config;
use ivr_orchestrator::http::{self, AppState};
use ivr_orchestrator::origination_queue::OriginationQueue;
use ivr_orchestrator::pbx::demux::PbxEventDemux;
use ivr_orchestrator::pbx::HttpPbxClient;
use ivr_orchestrator::push::PushRegistry;
use ivr_orchestrator::trunk::fetcher::TrunkInventoryFetcher;
use ivr_orchestrator::trunk::TrunkStore;
use ivr_orchestrator::validation::ValidationEndpoint;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env(std::env::args());
    tracing::info!(port = config.port, freepbx_ip = %config.freepbx_ip, "starting ivr-orchestrator");

    let trunks = TrunkStore::new(config.assignment_ttl);
    let calls = CallStore::new();
    let queue = OriginationQueue::new(config.origination_spacing, config.origination_queue_limit);
    let push = PushRegistry::new(config.push_terminal_close_delay);
    let channels = ChannelRegistry::new();
    let pbx = Arc::new(HttpPbxClient::new(format!("http://{}", config.freepbx_ip), config.pbx_rest_timeout));
    let catalog = HttpCampaignCatalog::new(format!("http://{}/campaigns.json", config.freepbx_ip), config.catalog_fetch_timeout);

    let actions = ActionEngine::new(calls.clone(), catalog.clone(), push.clone(), config.action_base_url.clone());
    let validation = ValidationEndpoint::new(calls.clone(), catalog.clone(), push.clone(), channels.clone(), config.action_base_url.clone());

    let state = AppState {
        trunks: trunks.clone(),
        calls: calls.clone(),
        queue,
        push: push.clone(),
        pbx: pbx.clone(),
        catalog: catalog.clone(),
        channels: channels.clone(),
        actions,
        validation,
        config: config.clone(),
    };

    let mut background = http::spawn_background_tasks(&state);

    let trunk_fetcher = TrunkInventoryFetcher::new(
        format!("http://{}/trunk-inventory.json", config.freepbx_ip),
        config.trunk_fetch_timeout,
        trunks.clone(),
    );
    background.push(trunk_fetcher.spawn_refresher(config.trunk_refresh_interval));
    background.push(catalog.spawn_refresher(config.catalog_refresh_interval));

    let demux = PbxEventDemux::new(format!("ws://{}/events", config.freepbx_ip), channels.clone(), push.clone(), &config);
    let demux_handle = tokio::spawn(demux.run());

    let app = http::router(state);
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, port = config.port, "failed to bind http listener");
            std::process::exit(1);
        }
    };

    tracing::info!(port = config.port, "ivr-orchestrator listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "http server error");
    }

    demux_handle.abort();
    for handle in background {
        handle.abort();
    }
    push.shutdown();
    tracing::info!("ivr-orchestrator shut down");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
