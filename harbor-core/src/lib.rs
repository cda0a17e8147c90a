//! Harbor Core - Keys, Events, and Entities
//!
//! Plain data shared by every harbor crate: the composite connection key,
//! the typed session events exchanged over the push channel, the
//! connection entity, and the error taxonomy. No I/O lives here.

pub mod connection;
pub mod data_action;
pub mod error;
pub mod event;
pub mod identity;

pub use connection::{
    compare_connections, compare_new_connections, AccessGrant, AuthProperty, Connection,
    ConnectionConfig, ConnectionInclude, ConnectionInitConfig, ConnectionOrigin, DatabaseSearchResult,
    NavigatorSettings, NavigatorSettingsPatch, NetworkHandlerConfig, TestConnectionResult,
};
pub use data_action::{DataAction, DataActionRegistry};
pub use error::{
    ActionError, HarborError, HarborResult, KeyError, LoadError, SyncError, TransportError,
};
pub use event::{
    ClientEventId, ConnectionStateEvent, DatasourceListEvent, EventId, EventPayload, EventTopic,
    PermissionsUpdatedEvent, ProjectsActiveEvent, ServerEventId, SessionEvent,
    SessionStateEvent, WebsocketConnectedEvent,
};
pub use identity::{keys_for_project, ConnectionId, ConnectionKey, ProjectId};
