//! Session collaborators consulted by the transport.
//!
//! The transport never decides on its own whether the browser-side network
//! is up, whether the server session expired, or how the activation
//! handshake works; it asks these traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use harbor_core::TransportError;

/// Reports whether the network is reachable.
pub trait NetworkState: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Reports whether the server session has expired.
pub trait SessionExpiry: Send + Sync {
    fn is_expired(&self) -> bool;
}

/// Handshake that must complete after every socket open before outbound
/// events are released.
#[async_trait]
pub trait Activation: Send + Sync {
    async fn activate(&self) -> Result<(), TransportError>;
}

/// A shareable boolean. Serves as network state (`true` = online) or as
/// session expiry (`true` = expired), depending on where it is plugged in.
#[derive(Debug, Clone, Default)]
pub struct SharedFlag(Arc<AtomicBool>);

impl SharedFlag {
    pub fn new(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl NetworkState for SharedFlag {
    fn is_online(&self) -> bool {
        self.get()
    }
}

impl SessionExpiry for SharedFlag {
    fn is_expired(&self) -> bool {
        self.get()
    }
}

/// Activation that completes immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoActivation;

#[async_trait]
impl Activation for NoActivation {
    async fn activate(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Everything the transport consults besides the socket itself.
#[derive(Clone)]
pub struct SessionCollaborators {
    pub network: Arc<dyn NetworkState>,
    pub session: Arc<dyn SessionExpiry>,
    pub activation: Arc<dyn Activation>,
}

impl SessionCollaborators {
    pub fn new(
        network: Arc<dyn NetworkState>,
        session: Arc<dyn SessionExpiry>,
        activation: Arc<dyn Activation>,
    ) -> Self {
        Self {
            network,
            session,
            activation,
        }
    }

    /// Reconnecting is allowed only online, with a live session.
    pub fn can_reconnect(&self) -> bool {
        self.network.is_online() && !self.session.is_expired()
    }
}

impl Default for SessionCollaborators {
    /// Always online, never expired, no handshake.
    fn default() -> Self {
        Self {
            network: Arc::new(SharedFlag::new(true)),
            session: Arc::new(SharedFlag::new(false)),
            activation: Arc::new(NoActivation),
        }
    }
}
