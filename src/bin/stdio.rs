//! Stdio host: line-delimited JSON-RPC over stdin/stdout.

use serde_json::json;
use std::sync::Arc;

use estatedesk::estatedesk::config::Config;
use estatedesk::estatedesk::logging;
use estatedesk::estatedesk::rpc_server::RpcServer;
use estatedesk::estatedesk::session::Session;
use estatedesk::estatedesk::telemetry::Telemetry;
use estatedesk::estatedesk::tools;
use estatedesk::estatedesk::transport::{StdioTransport, Transport};

const CAPABILITIES: [&str; 3] = ["logging", "streaming", "interrupt"];

#[tokio::main]
async fn main() {
    let config = Arc::new(Config::from_env());
    if let Err(e) = logging::init(&config) {
        eprintln!("Failed to initialize logging: {}", e);
    }

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
    if !config.company_id.is_empty() {
        if let Err(e) = session.set_default_tenant(&config.company_id).await {
            log::error!("Invalid COMPANY_ID: {}", e);
            std::process::exit(1);
        }
    }

    let telemetry = Telemetry::new(Arc::clone(&config));
    let mut server = RpcServer::new(Arc::clone(&session), Arc::clone(&telemetry));
    for tool in tools::all_tools() {
        server.register_tool(tool);
    }
    for cap in CAPABILITIES {
        server.capability(cap).await;
    }
    {
        let config = Arc::clone(&config);
        server.resource("config://config", move || config.resource_view());
    }
    telemetry.record("server_start", 0, true, None);

    let mut transport = StdioTransport::new();
    for cap in CAPABILITIES {
        transport
            .write_message(&json!({
                "jsonrpc": "1.0",
                "method": "capabilities",
                "params": {"name": cap, "enabled": true},
            }))
            .await;
    }

    tokio::select! {
        _ = server.serve(&mut transport) => {
            log::info!("Serve loop finished");
        }
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received");
        }
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
