//! OCPP RPC Node - CLI networking node
//!
//! Runs a central system, a charge point or a gateway, depending on which
//! sides are enabled.
//!
//! # Usage
//!
//! ```bash
//! # Central system accepting charge points and gateways
//! ocpp-rpc-node --name CSMS --listen 0.0.0.0:9000 --route CP042=GW1
//!
//! # Gateway: accepts charge points, dials the central system
//! ocpp-rpc-node --name GW1 --listen 0.0.0.0:9100 \
//!     --connect ws://localhost:9000/ocpp --upstream CSMS
//!
//! # Charge point behind the gateway, heartbeat every 60 s
//! ocpp-rpc-node --name CP042 --connect ws://localhost:9100/ocpp --upstream GW1 \
//!     --route CSMS=GW1 --heartbeat 60
//! ```

use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use ocpp_rpc::ws::{self, WsClientConfig, WsServerConfig};
use ocpp_rpc::{
    CallOptions, ConnectionEvent, HandlerError, NetworkingNode, NodeConfig, RequestEnvelope,
};
use serde_json::json;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 1.6 networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identity
    #[arg(short, long)]
    name: String,

    /// Accept WebSocket connections on this address
    #[arg(long)]
    listen: Option<String>,

    /// Dial this base URL (the node name is appended)
    #[arg(long)]
    connect: Option<String>,

    /// Node id of the peer behind --connect
    #[arg(long, default_value = "CSMS")]
    upstream: String,

    /// Static route DEST=VIA (can be repeated)
    #[arg(long)]
    route: Vec<String>,

    /// Default call timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Send Heartbeat to --upstream every N seconds
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP RPC Node - OCPP 1.6 Networking             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.name);
    println!("║  Listen:   {:<50} ║", args.listen.as_deref().unwrap_or("-"));
    println!("║  Connect:  {:<50} ║", truncate(args.connect.as_deref().unwrap_or("-"), 50));
    println!("║  Upstream: {:<50} ║", args.upstream);
    println!("║  Routes:   {:<50} ║", args.route.len());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let mut config =
        NodeConfig::new(args.name.as_str()).with_default_timeout(Duration::from_secs(args.timeout));
    for route in &args.route {
        match route.split_once('=') {
            Some((destination, via)) if !destination.is_empty() && !via.is_empty() => {
                info!("Route {} via {}", destination, via);
                config = config.with_route(destination, via);
            }
            _ => eprintln!("Invalid route (expected DEST=VIA): {}", route),
        }
    }

    let node = NetworkingNode::new(config);
    register_handlers(&node);

    let mut events = node.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Opened { node_id, connection_id, direction } => {
                    info!("{} connected ({:?}, connection {})", node_id, direction, connection_id)
                }
                ConnectionEvent::Closed { node_id, connection_id, superseded } => {
                    info!(
                        "{} disconnected (connection {}{})",
                        node_id,
                        connection_id,
                        if superseded { ", superseded" } else { "" }
                    )
                }
            }
        }
    });

    if let Some(bind_addr) = args.listen.clone() {
        let server = node.clone();
        tokio::spawn(async move {
            let config = WsServerConfig {
                bind_addr,
                ..Default::default()
            };
            if let Err(e) = ws::serve(server, config).await {
                error!("Server stopped: {}", e);
            }
        });
    }

    if let Some(url) = args.connect.clone() {
        tokio::spawn(ws::connect(node.clone(), WsClientConfig::new(url, args.upstream.as_str())));
    }

    if let Some(period) = args.heartbeat {
        tokio::spawn(heartbeat_loop(node.clone(), args.upstream.clone(), period));
    }

    info!("Node {} running, Ctrl-C to stop", node.id());
    tokio::signal::ctrl_c().await?;

    node.shutdown();
    let stats = node.correlator().stats();
    info!(
        "Stopped: {} calls, {} completed, {} timed out, {} cancelled, {} lost",
        stats.created, stats.completed, stats.timed_out, stats.cancelled, stats.connection_lost
    );

    Ok(())
}

/// Handlers for the actions a demo node answers in either role
fn register_handlers(node: &NetworkingNode) {
    node.register_handler("Heartbeat", |_req: RequestEnvelope| async {
        Ok::<_, HandlerError>(json!({ "currentTime": Utc::now() }))
    });

    node.register_handler("BootNotification", |req: RequestEnvelope| async move {
        info!(
            "BootNotification from {}: {}",
            req.network_path.origin().map(|id| id.as_str()).unwrap_or("?"),
            req.payload
        );
        Ok::<_, HandlerError>(json!({
            "status": "Accepted",
            "currentTime": Utc::now(),
            "interval": 300
        }))
    });

    node.register_handler("StatusNotification", |req: RequestEnvelope| async move {
        info!("StatusNotification: {}", req.payload);
        Ok::<_, HandlerError>(json!({}))
    });

    node.register_handler("Reset", |req: RequestEnvelope| async move {
        info!("Reset requested: {}", req.payload);
        Ok::<_, HandlerError>(json!({ "status": "Accepted" }))
    });
}

async fn heartbeat_loop(node: NetworkingNode, upstream: String, period: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(period.max(1)));
    loop {
        interval.tick().await;
        match node
            .call(upstream.as_str(), "Heartbeat", json!({}), CallOptions::default())
            .await
            .and_then(|response| response.into_payload())
        {
            Ok(payload) => info!("Heartbeat accepted by {}: {}", upstream, payload),
            Err(e) => warn!("Heartbeat to {} failed: {}", upstream, e),
        }
    }
}

/// Truncate string with ellipsis, counting characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
