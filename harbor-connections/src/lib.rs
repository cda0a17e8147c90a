//! Harbor Connections - Connection Info Cache
//!
//! The connection cache of the console: a [`KeyedCache`] of connections
//! keyed by project and connection id, the GraphQL service it loads from,
//! and the glue that turns datasource push events into cache invalidation.
//!
//! [`KeyedCache`]: harbor_storage::KeyedCache

pub mod graphql;
pub mod invalidation;
pub mod loader;
pub mod projects;
pub mod resource;
pub mod service;
pub mod sync;

pub use graphql::{GraphQlConnectionService, GraphQlError};
pub use invalidation::{
    InvalidationAction, InvalidationEffect, InvalidationGlue, InvalidationRule,
    CONNECTION_INVALIDATION,
};
pub use loader::{ConnectionLoader, ACTIVE_PROJECTS_ALIAS, PROJECTS_ALIAS};
pub use projects::ActiveProjects;
pub use resource::{
    active_projects_key, includes, project_key, ConnectionInfoResource, ConnectionMetadata,
    DataOutdated,
};
pub use service::{ConnectionQuery, ConnectionService};
pub use sync::{AutoApprove, DataSynchronization};
