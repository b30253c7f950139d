//! Send client demo
//!
//! Connects to a server, sends each line from stdin as a message and prints
//! whatever comes back. Configuration comes from sockline-client.toml and
//! `SOCKLINE_CLIENT_*` environment variables.

use log::{error, info};
use std::io::BufRead;

use sockline::{Client, ClientConfig, Message};

fn main() {
    env_logger::init();

    let config = match ClientConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let client = Client::new(config);
    client.on_message(|msg| {
        println!("<- [{}] {}", msg.kind, String::from_utf8_lossy(&msg.payload));
    });
    client.on_disconnected(|peer| {
        info!("Connection to {} closed", peer);
        std::process::exit(0);
    });

    if let Err(e) = client.connect() {
        error!("Connect failed: {}", e);
        std::process::exit(1);
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.is_empty() {
            continue;
        }
        if let Err(e) = client.send(&Message::new(0, 0, 0, line.into_bytes())) {
            error!("Send failed: {}", e);
            break;
        }
    }

    if let Err(e) = client.disconnect() {
        error!("Disconnect failed: {}", e);
    }
}
