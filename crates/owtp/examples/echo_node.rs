//! Minimal OWTP node answering `echo` and `time`.
//!
//! ```text
//! cargo run -p owtp --example echo_node -- owtp.toml
//! ```
//!
//! Without `[[listen]]` entries in the config the node listens for
//! WebSocket peers on 127.0.0.1:9420.

use owtp::config::validate_config;
use owtp::{load_config, ConnectConfig, ConnectType, OwtpNode};
use serde_json::json;
use std::path::PathBuf;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing_stderr();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = load_config(path.as_deref());
    if config.listen.is_empty() {
        config
            .listen
            .push(ConnectConfig::new(ConnectType::Ws, "127.0.0.1:9420"));
    }
    for problem in validate_config(&config) {
        tracing::warn!("OWTP: {}", problem);
    }

    let node = OwtpNode::new(config)?;
    node.handle_func("echo", |ctx| {
        let params = ctx.params().clone();
        ctx.response(params, 200, "success");
    });
    node.handle_func("time", |ctx| {
        let now = chrono::Utc::now().to_rfc3339();
        ctx.response(json!({ "now": now }), 200, "success");
    });
    node.set_open_handler(|peer| {
        tracing::info!(peer = %peer.pid(), remote = %peer.remote_addr(), "OWTP: peer online");
    });
    node.set_close_handler(|peer| {
        tracing::info!(peer = %peer.pid(), "OWTP: peer offline");
    });

    node.listen_configured().await?;
    tracing::info!(node_id = %node.node_id(), "OWTP: echo node ready");

    tokio::signal::ctrl_c().await?;
    node.close().await;
    Ok(())
}
