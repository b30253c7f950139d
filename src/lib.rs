//! Connection-oriented messaging over TCP and UDP.
//!
//! A [`Server`] accepts clients, assigns them ids and hands every inbound
//! frame to registered handlers; a [`Client`] holds one connection to such
//! a server. Both sides speak the same length-prefixed [`Message`] framing
//! and dispatch events synchronously on the thread that produced them.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod registry;
pub mod server;
mod transport;

pub use client::{Client, ConnStatus};
pub use config::{ClientConfig, IpVersion, ServerConfig, Transport};
pub use error::{ClientError, FrameError, RegistryError, ServerError};
pub use events::Admission;
pub use message::{DEFAULT_MAX_PAYLOAD, HEADER_LEN, MAX_EXTENSION, Message};
pub use registry::{CLIENT_ID_BASE, ClientId, ClientInfo};
pub use server::{Server, ServerStatus};
