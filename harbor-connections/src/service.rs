//! Remote connection service.

use async_trait::async_trait;
use harbor_core::{
    AccessGrant, Connection, ConnectionConfig, ConnectionInitConfig, ConnectionKey,
    DatabaseSearchResult, LoadError, NavigatorSettings, TestConnectionResult,
};
use harbor_storage::IncludeSet;

/// Filter of a `getUserConnections` query. Every field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionQuery {
    pub project_id: Option<String>,
    pub connection_id: Option<String>,
    pub project_ids: Option<Vec<String>>,
    pub includes: IncludeSet,
}

impl ConnectionQuery {
    pub fn for_key(key: &ConnectionKey, includes: &IncludeSet) -> Self {
        Self {
            project_id: Some(key.project_id().to_string()),
            connection_id: Some(key.connection_id().to_string()),
            project_ids: None,
            includes: includes.clone(),
        }
    }

    pub fn for_projects(project_ids: Vec<String>, includes: &IncludeSet) -> Self {
        Self {
            project_ids: Some(project_ids),
            includes: includes.clone(),
            ..Default::default()
        }
    }

    pub fn everything(includes: &IncludeSet) -> Self {
        Self {
            includes: includes.clone(),
            ..Default::default()
        }
    }
}

/// Server operations on connections.
///
/// Calls that return a connection accept the include groups the result must
/// carry.
#[async_trait]
pub trait ConnectionService: Send + Sync + 'static {
    async fn get_user_connections(&self, query: &ConnectionQuery) -> Result<Vec<Connection>, LoadError>;

    async fn create_connection(
        &self,
        project_id: &str,
        config: &ConnectionConfig,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError>;

    async fn create_connection_from_template(
        &self,
        project_id: &str,
        template_id: &str,
        connection_name: &str,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError>;

    async fn create_connection_from_node(
        &self,
        project_id: &str,
        node_path: &str,
        name: &str,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError>;

    async fn test_connection(
        &self,
        project_id: &str,
        config: &ConnectionConfig,
    ) -> Result<TestConnectionResult, LoadError>;

    async fn init_connection(
        &self,
        config: &ConnectionInitConfig,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError>;

    async fn update_connection(
        &self,
        project_id: &str,
        config: &ConnectionConfig,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError>;

    async fn close_connection(&self, key: &ConnectionKey, includes: &IncludeSet) -> Result<Connection, LoadError>;

    async fn delete_connection(&self, key: &ConnectionKey) -> Result<(), LoadError>;

    async fn set_navigator_settings(
        &self,
        key: &ConnectionKey,
        settings: &NavigatorSettings,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError>;

    async fn get_connection_access(&self, key: &ConnectionKey) -> Result<Vec<AccessGrant>, LoadError>;

    async fn add_connections_access(
        &self,
        project_id: &str,
        connection_ids: &[String],
        subjects: &[String],
    ) -> Result<(), LoadError>;

    async fn delete_connections_access(
        &self,
        project_id: &str,
        connection_ids: &[String],
        subjects: &[String],
    ) -> Result<(), LoadError>;

    async fn search_databases(&self, hosts: &[String]) -> Result<Vec<DatabaseSearchResult>, LoadError>;

    /// Ask the server to re-read the session's connection list. Returns
    /// whether anything changed.
    async fn refresh_session_connections(&self) -> Result<bool, LoadError>;
}
