//! Fetches connections for the cache.

use std::sync::Arc;

use async_trait::async_trait;
use harbor_core::{Connection, ConnectionKey, LoadError};
use harbor_storage::{IncludeSet, ResourceAlias, ResourceLoader};
use tracing::debug;

use crate::projects::ActiveProjects;
use crate::service::{ConnectionQuery, ConnectionService};

/// Connections of the projects named in the alias parameters.
pub const PROJECTS_ALIAS: &str = "@connection-info/projects";

/// Connections of the currently active projects.
pub const ACTIVE_PROJECTS_ALIAS: &str = "@connection-info/projects-active";

/// [`ResourceLoader`] over a [`ConnectionService`].
pub struct ConnectionLoader {
    service: Arc<dyn ConnectionService>,
    active_projects: ActiveProjects,
}

impl ConnectionLoader {
    pub fn new(service: Arc<dyn ConnectionService>, active_projects: ActiveProjects) -> Self {
        Self {
            service,
            active_projects,
        }
    }

    fn alias_query(&self, alias: &ResourceAlias, includes: &IncludeSet) -> Result<ConnectionQuery, LoadError> {
        if alias.is_all() {
            return Ok(ConnectionQuery::everything(includes));
        }
        match alias.name() {
            PROJECTS_ALIAS => Ok(ConnectionQuery::for_projects(alias.params().to_vec(), includes)),
            ACTIVE_PROJECTS_ALIAS => Ok(ConnectionQuery::for_projects(self.active_projects.ids(), includes)),
            _ => Err(LoadError::UnsupportedAlias(alias.to_string())),
        }
    }
}

#[async_trait]
impl ResourceLoader<Connection> for ConnectionLoader {
    async fn load_key(&self, key: &ConnectionKey, includes: &IncludeSet) -> Result<Connection, LoadError> {
        let query = ConnectionQuery::for_key(key, includes);
        let connection = self
            .service
            .get_user_connections(&query)
            .await?
            .into_iter()
            .find(|connection| connection.id == key.connection_id())
            .ok_or_else(|| {
                LoadError::NotFound(format!("Connection is not found ({})", key.connection_id()))
            })?;
        Ok(connection)
    }

    async fn load_alias(&self, alias: &ResourceAlias, includes: &IncludeSet) -> Result<Vec<Connection>, LoadError> {
        let query = self.alias_query(alias, includes)?;
        let connections = self.service.get_user_connections(&query).await?;
        debug!(alias = %alias, count = connections.len(), "Loaded connections");
        Ok(connections)
    }
}
