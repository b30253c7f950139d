//! Error types
//!
//! Defines domain-specific error types for each module of the library.
//! Every public operation returns one of these instead of panicking, and
//! callers are expected to branch on the variant.

use std::fmt;
use std::io;

use crate::registry::ClientId;
use crate::server::ServerStatus;

/// Client registry errors
#[derive(Debug)]
pub enum RegistryError {
    CapacityExceeded(usize),
    NotFound(ClientId),
    ReceiverAttached(ClientId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::CapacityExceeded(cap) => {
                write!(f, "Registry full: capacity is {} clients", cap)
            }
            RegistryError::NotFound(id) => write!(f, "Client not found: {}", id),
            RegistryError::ReceiverAttached(id) => {
                write!(f, "Receive worker already attached for client: {}", id)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Message framing errors
#[derive(Debug)]
pub enum FrameError {
    PayloadTooLarge { size: usize, max: usize },
    ExtensionTooLarge { size: usize, max: usize },
    Truncated { expected: usize, actual: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::PayloadTooLarge { size, max } => {
                write!(f, "Payload of {} bytes exceeds maximum of {}", size, max)
            }
            FrameError::ExtensionTooLarge { size, max } => {
                write!(f, "Extension of {} bytes exceeds maximum of {}", size, max)
            }
            FrameError::Truncated { expected, actual } => {
                write!(f, "Truncated frame: expected {} bytes, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Server module errors
#[derive(Debug)]
pub enum ServerError {
    InvalidConfig(String),
    Socket(io::Error),
    Bind(io::Error),
    Listen(io::Error),
    Accept(io::Error),
    Thread(io::Error),
    Send(io::Error),
    Receive(io::Error),
    Stop(String),
    InvalidClient(ClientId),
    InvalidMessage(FrameError),
    InvalidStatus(ServerStatus),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            ServerError::Socket(e) => write!(f, "Socket creation failed: {}", e),
            ServerError::Bind(e) => write!(f, "Bind failed: {}", e),
            ServerError::Listen(e) => write!(f, "Listen failed: {}", e),
            ServerError::Accept(e) => write!(f, "Accept failed: {}", e),
            ServerError::Thread(e) => write!(f, "Worker spawn failed: {}", e),
            ServerError::Send(e) => write!(f, "Send failed: {}", e),
            ServerError::Receive(e) => write!(f, "Receive failed: {}", e),
            ServerError::Stop(msg) => write!(f, "Stop failed: {}", msg),
            ServerError::InvalidClient(id) => write!(f, "Invalid client: {}", id),
            ServerError::InvalidMessage(e) => write!(f, "Invalid message: {}", e),
            ServerError::InvalidStatus(status) => {
                write!(f, "Operation not allowed while server is {}", status)
            }
        }
    }
}

impl std::error::Error for ServerError {}

impl From<FrameError> for ServerError {
    fn from(error: FrameError) -> Self {
        ServerError::InvalidMessage(error)
    }
}

/// Client module errors
#[derive(Debug)]
pub enum ClientError {
    InvalidConfig(String),
    Socket(io::Error),
    Connect(io::Error),
    Send(io::Error),
    Receive(io::Error),
    Concurrency(io::Error),
    InvalidMessage(FrameError),
    InvalidStatus(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            ClientError::Socket(e) => write!(f, "Socket creation failed: {}", e),
            ClientError::Connect(e) => write!(f, "Connect failed: {}", e),
            ClientError::Send(e) => write!(f, "Send failed: {}", e),
            ClientError::Receive(e) => write!(f, "Receive failed: {}", e),
            ClientError::Concurrency(e) => write!(f, "Worker spawn failed: {}", e),
            ClientError::InvalidMessage(e) => write!(f, "Invalid message: {}", e),
            ClientError::InvalidStatus(msg) => write!(f, "Invalid connection state: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<FrameError> for ClientError {
    fn from(error: FrameError) -> Self {
        ClientError::InvalidMessage(error)
    }
}
