//! Server side
//!
//! This module contains the connection manager: the accept loop, the client
//! registry, per-client receive workers and the lifecycle status machine.

pub mod core;

mod accept;
mod recv;

pub use self::core::{Server, ServerStatus};
