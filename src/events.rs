//! Event dispatch
//!
//! Both endpoints surface activity through registered callbacks rather than
//! polling. Each event kind has one optional slot; registering again
//! replaces the previous handler (last registration wins, no multicast).
//! Dispatch is synchronous on the worker thread that observed the event, so
//! a slow new-client handler delays the next accept and a slow message
//! handler delays that client's next read. Handlers must not block; calls
//! that wait on the workers themselves (`Server::wait`, `Server::stop`)
//! belong on application threads, not in handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::ConnStatus;
use crate::message::Message;
use crate::registry::ClientInfo;
use crate::server::ServerStatus;

/// Admission decision handed to the new-client handler.
///
/// Arrives already refused when the registry is at capacity; otherwise the
/// handler may call `refuse` to have the connection closed as soon as it
/// returns. Either way the connection was accepted at the transport level
/// first, so the remote end observes a clean close rather than a timeout.
#[derive(Debug)]
pub struct Admission {
    accepted: bool,
    at_capacity: bool,
}

impl Admission {
    pub(crate) fn granted() -> Self {
        Self {
            accepted: true,
            at_capacity: false,
        }
    }

    pub(crate) fn denied_capacity() -> Self {
        Self {
            accepted: false,
            at_capacity: true,
        }
    }

    /// Rejects the client. The server closes the connection right after the
    /// handler returns; no disconnect event will fire for it.
    pub fn refuse(&mut self) {
        self.accepted = false;
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// True when the refusal came from the capacity limit rather than a
    /// handler decision. A capacity refusal cannot be overturned.
    pub fn at_capacity(&self) -> bool {
        self.at_capacity
    }
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync + 'static>;
pub type StatusHandler = Arc<dyn Fn(ServerStatus) + Send + Sync + 'static>;
pub type NewClientHandler = Arc<dyn Fn(&ClientInfo, &mut Admission) + Send + Sync + 'static>;
pub type ClientGoneHandler = Arc<dyn Fn(&ClientInfo) + Send + Sync + 'static>;
pub type PeerHandler = Arc<dyn Fn(SocketAddr) + Send + Sync + 'static>;
pub type ConnStatusHandler = Arc<dyn Fn(&ConnStatus) + Send + Sync + 'static>;

/// Handler slots of a server. `None` slots drop their events.
///
/// The table clones cheaply, so emitters snapshot it and dispatch without
/// holding the registration lock. A handler may therefore re-enter the
/// server (send, disconnect, even re-register) without deadlocking.
#[derive(Default, Clone)]
pub(crate) struct ServerHandlers {
    pub(crate) message: Option<MessageHandler>,
    pub(crate) message_sent: Option<MessageHandler>,
    pub(crate) status_changed: Option<StatusHandler>,
    pub(crate) client_connected: Option<NewClientHandler>,
    pub(crate) client_disconnected: Option<ClientGoneHandler>,
}

impl ServerHandlers {
    pub(crate) fn fire_message(&self, msg: &Message) {
        if let Some(handler) = &self.message {
            handler(msg);
        }
    }

    pub(crate) fn fire_message_sent(&self, msg: &Message) {
        if let Some(handler) = &self.message_sent {
            handler(msg);
        }
    }

    pub(crate) fn fire_status_changed(&self, status: ServerStatus) {
        if let Some(handler) = &self.status_changed {
            handler(status);
        }
    }

    pub(crate) fn fire_client_connected(&self, info: &ClientInfo, admission: &mut Admission) {
        if let Some(handler) = &self.client_connected {
            handler(info, admission);
        }
    }

    pub(crate) fn fire_client_disconnected(&self, info: &ClientInfo) {
        if let Some(handler) = &self.client_disconnected {
            handler(info);
        }
    }
}

/// Handler slots of a client. `None` slots drop their events.
#[derive(Default, Clone)]
pub(crate) struct ClientHandlers {
    pub(crate) message: Option<MessageHandler>,
    pub(crate) message_sent: Option<MessageHandler>,
    pub(crate) status_changed: Option<ConnStatusHandler>,
    pub(crate) connected: Option<PeerHandler>,
    pub(crate) disconnected: Option<PeerHandler>,
}

impl ClientHandlers {
    pub(crate) fn fire_message(&self, msg: &Message) {
        if let Some(handler) = &self.message {
            handler(msg);
        }
    }

    pub(crate) fn fire_message_sent(&self, msg: &Message) {
        if let Some(handler) = &self.message_sent {
            handler(msg);
        }
    }

    pub(crate) fn fire_status_changed(&self, status: &ConnStatus) {
        if let Some(handler) = &self.status_changed {
            handler(status);
        }
    }

    pub(crate) fn fire_connected(&self, peer: SocketAddr) {
        if let Some(handler) = &self.connected {
            handler(peer);
        }
    }

    pub(crate) fn fire_disconnected(&self, peer: SocketAddr) {
        if let Some(handler) = &self.disconnected {
            handler(peer);
        }
    }
}
