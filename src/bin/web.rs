//! Web host: HTTP + WebSocket surface over the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use estatedesk::estatedesk::config::Config;
use estatedesk::estatedesk::enrichment::Enricher;
use estatedesk::estatedesk::llm::OpenAiClient;
use estatedesk::estatedesk::logging;
use estatedesk::estatedesk::orchestrator::{Orchestrator, ToolDispatcher};
use estatedesk::estatedesk::rpc_server::RpcServer;
use estatedesk::estatedesk::session::Session;
use estatedesk::estatedesk::telemetry::Telemetry;
use estatedesk::estatedesk::tools;
use estatedesk::estatedesk::web::{self, AppState};

#[tokio::main]
async fn main() {
    let config = Arc::new(Config::from_env());
    if let Err(e) = logging::init(&config) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let Some(api_key) = config.openai_api_key.clone() else {
        log::error!("OPENAI_API_KEY is required for the web host");
        std::process::exit(1);
    };
    let model = config
        .model_name
        .clone()
        .unwrap_or_else(|| "gpt-4o-mini".to_string());

    let session = match Session::new(Arc::clone(&config)).await {
        Ok(session) => Arc::new(session),
        Err(e) => {
            log::error!("Failed to initialize session: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = session.connect().await {
        log::error!("Failed to connect to MongoDB: {}", e);
        std::process::exit(1);
    }

    let telemetry = Telemetry::new(Arc::clone(&config));
    let mut server = RpcServer::new(Arc::clone(&session), Arc::clone(&telemetry));
    for tool in tools::all_tools() {
        server.register_tool(tool);
    }
    for cap in ["logging", "streaming", "interrupt"] {
        server.capability(cap).await;
    }
    {
        let config = Arc::clone(&config);
        server.resource("config://config", move || config.resource_view());
    }
    let server = Arc::new(server);
    telemetry.record("server_start", 0, true, None);

    let llm = Arc::new(OpenAiClient::new(
        &api_key,
        &model,
        Duration::from_secs(config.llm_timeout_secs),
    ));
    let enricher = Arc::new(Enricher::new(session.database(None)));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&session),
        Arc::clone(&server) as Arc<dyn ToolDispatcher>,
        llm,
        enricher,
    ));

    let app = web::app(Arc::new(AppState { orchestrator }));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    log::info!("Host ready on {} - model={}", addr, model);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        log::error!("Server error: {}", e);
    }

    telemetry.record("server_stop", 0, true, None);
    server.close().await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
