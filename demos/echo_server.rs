//! Echo server demo
//!
//! Starts a server that logs lifecycle events and echoes every message back
//! to the client it came from. Configuration comes from sockline.toml and
//! `SOCKLINE_*` environment variables (`RUST_LOG=info` shows the traffic).

use log::{error, info};
use std::sync::Arc;

use sockline::{Message, Server, ServerConfig};

fn main() {
    env_logger::init();

    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let server = Arc::new(Server::new(config));

    server.on_client_connected(|info, admission| {
        if admission.is_accepted() {
            info!("Client {} joined from {}", info.id, info.remote_addr);
        } else {
            info!("Client from {} turned away", info.remote_addr);
        }
    });
    server.on_client_disconnected(|info| {
        info!("Client {} left", info.id);
    });

    let echo = Arc::clone(&server);
    server.on_message(move |msg| {
        let reply = Message::new(0, msg.source, msg.kind, msg.payload.clone());
        let sender = match echo.clients().iter().find(|c| c.id.raw() == msg.source) {
            Some(client) => client.id,
            None => return,
        };
        if let Err(e) = echo.send(sender, &reply) {
            error!("Echo to client {} failed: {}", sender, e);
        }
    });

    if let Err(e) = server.start() {
        error!("Server failed to start: {}", e);
        std::process::exit(1);
    }
    info!(
        "Echo server listening on {}",
        server.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    // Runs until the process is killed or a systemic failure stops it.
    if let Err(e) = server.wait() {
        error!("Wait ended: {}", e);
    }
}
