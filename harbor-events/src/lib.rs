//! Harbor Events - Session Push Channel
//!
//! One long-lived websocket to the server, typed [`SessionEvent`]s fanned out
//! to subscribers, and reference-counted topic subscriptions.
//!
//! [`SessionEvent`]: harbor_core::SessionEvent

pub mod config;
pub mod router;
pub mod session;
pub mod socket;
pub mod transport;

pub use config::TransportConfig;
pub use router::{EventRouter, EventStream, Subscription, TopicFeed, TopicStream};
pub use session::{Activation, NetworkState, NoActivation, SessionCollaborators, SessionExpiry, SharedFlag};
pub use socket::{Connector, SocketLink, SocketSignal, TungsteniteConnector};
pub use transport::{EventTransport, TransportState};
