//! [`ConnectionService`] over the console's GraphQL endpoint.

use std::time::Duration;

use async_trait::async_trait;
use harbor_core::{
    AccessGrant, Connection, ConnectionConfig, ConnectionInclude, ConnectionInitConfig,
    ConnectionKey, DatabaseSearchResult, LoadError, NavigatorSettings, TestConnectionResult,
};
use harbor_storage::IncludeSet;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::service::{ConnectionQuery, ConnectionService};

/// Errors talking to the GraphQL endpoint.
#[derive(Debug, Error)]
pub enum GraphQlError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

impl From<GraphQlError> for LoadError {
    fn from(err: GraphQlError) -> Self {
        match err {
            GraphQlError::Server(message) => LoadError::Remote(message),
            other => LoadError::Remote(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    errors: Vec<GraphQlServerError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlServerError {
    message: String,
}

// ============================================================================
// DOCUMENTS
// ============================================================================

const CONNECTION_FIELDS: &str = r#"
fragment ConnectionInfo on ConnectionInfo {
  id
  projectId
  name
  description
  driverId
  connected
  template
  readOnly
  folder
  nodePath
  navigatorSettings { showOnlyEntities hideFolders hideVirtualModel hideSchemas mergeEntities showSystemObjects showUtilityObjects }
  networkHandlersConfig @include(if: $includeNetworkHandlersConfig) { id enabled authType userName savePassword properties secureProperties }
  authProperties @include(if: $includeAuthProperties) { id displayName value features }
  authNeeded @include(if: $includeAuthNeeded)
  credentialsSaved @include(if: $includeCredentialsSaved)
  properties @include(if: $includeProperties)
  providerProperties @include(if: $includeProviderProperties)
  origin @include(if: $customIncludeOptions) { type subType displayName }
}
"#;

const INCLUDE_VARIABLES: &str = "$includeNetworkHandlersConfig: Boolean!, $includeAuthProperties: Boolean!, $includeAuthNeeded: Boolean!, $includeCredentialsSaved: Boolean!, $includeProperties: Boolean!, $includeProviderProperties: Boolean!, $customIncludeOptions: Boolean!";

fn connection_document(operation: &str, arguments: &str, selection: &str) -> String {
    format!(
        "{operation}({arguments}, {INCLUDE_VARIABLES}) {{ {selection} {{ ...ConnectionInfo }} }}\n{CONNECTION_FIELDS}"
    )
}

/// GraphQL client for connection operations.
#[derive(Clone)]
pub struct GraphQlConnectionService {
    client: reqwest::Client,
    endpoint: String,
}

impl GraphQlConnectionService {
    /// The client keeps cookies so the session established by the first
    /// request is reused by every later one.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, GraphQlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open (or touch) the server session.
    pub async fn open_session(&self) -> Result<(), GraphQlError> {
        self.execute::<JsonValue>(
            "mutation openSession { session: openSession { valid } }",
            JsonValue::Object(Map::new()),
            "session",
        )
        .await?;
        Ok(())
    }

    /// Run one operation and deserialize `data.<field>`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: JsonValue,
        field: &str,
    ) -> Result<T, GraphQlError> {
        debug!(field, "GraphQL request");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            return Err(GraphQlError::InvalidResponse(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }

        let body: GraphQlResponse = response.json().await?;
        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(GraphQlError::Server(messages.join("; ")));
        }
        let mut data = body
            .data
            .ok_or_else(|| GraphQlError::InvalidResponse("response has no data".to_string()))?;
        let value = data
            .get_mut(field)
            .map(JsonValue::take)
            .ok_or_else(|| GraphQlError::InvalidResponse(format!("missing field {field}")))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn connection_call(
        &self,
        document: String,
        mut variables: Map<String, JsonValue>,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        variables.extend(include_variables(includes));
        Ok(self
            .execute(&document, JsonValue::Object(variables), "connection")
            .await?)
    }
}

/// One boolean variable per include group.
pub fn include_variables(includes: &IncludeSet) -> Map<String, JsonValue> {
    ConnectionInclude::ALL
        .iter()
        .map(|include| {
            (
                include.variable().to_string(),
                JsonValue::Bool(includes.contains(include.variable())),
            )
        })
        .collect()
}

fn vars(pairs: impl IntoIterator<Item = (&'static str, JsonValue)>) -> Map<String, JsonValue> {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, LoadError> {
    serde_json::to_value(value).map_err(|e| LoadError::from(GraphQlError::from(e)))
}

#[async_trait]
impl ConnectionService for GraphQlConnectionService {
    async fn get_user_connections(&self, query: &ConnectionQuery) -> Result<Vec<Connection>, LoadError> {
        let document = connection_document(
            "query getUserConnections",
            "$projectId: ID, $connectionId: ID, $projectIds: [ID!]",
            "connections: userConnections(projectId: $projectId, id: $connectionId, projectIds: $projectIds)",
        );
        let mut variables = vars([
            ("projectId", json!(query.project_id)),
            ("connectionId", json!(query.connection_id)),
            ("projectIds", json!(query.project_ids)),
        ]);
        variables.extend(include_variables(&query.includes));
        Ok(self
            .execute(&document, JsonValue::Object(variables), "connections")
            .await?)
    }

    async fn create_connection(
        &self,
        project_id: &str,
        config: &ConnectionConfig,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        let document = connection_document(
            "mutation createConnection",
            "$projectId: ID!, $config: ConnectionConfig!",
            "connection: createConnection(projectId: $projectId, config: $config)",
        );
        let variables = vars([("projectId", json!(project_id)), ("config", to_json(config)?)]);
        self.connection_call(document, variables, includes).await
    }

    async fn create_connection_from_template(
        &self,
        project_id: &str,
        template_id: &str,
        connection_name: &str,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        let document = connection_document(
            "mutation createConnectionFromTemplate",
            "$projectId: ID!, $templateId: ID!, $connectionName: String!",
            "connection: createConnectionFromTemplate(projectId: $projectId, templateId: $templateId, connectionName: $connectionName)",
        );
        let variables = vars([
            ("projectId", json!(project_id)),
            ("templateId", json!(template_id)),
            ("connectionName", json!(connection_name)),
        ]);
        self.connection_call(document, variables, includes).await
    }

    async fn create_connection_from_node(
        &self,
        project_id: &str,
        node_path: &str,
        name: &str,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        let document = connection_document(
            "mutation createConnectionFromNode",
            "$projectId: ID!, $nodePath: String!, $config: ConnectionConfig",
            "connection: copyConnectionFromNode(projectId: $projectId, nodePath: $nodePath, config: $config)",
        );
        let variables = vars([
            ("projectId", json!(project_id)),
            ("nodePath", json!(node_path)),
            ("config", json!({ "name": name })),
        ]);
        self.connection_call(document, variables, includes).await
    }

    async fn test_connection(
        &self,
        project_id: &str,
        config: &ConnectionConfig,
    ) -> Result<TestConnectionResult, LoadError> {
        let document = "mutation testConnection($projectId: ID!, $config: ConnectionConfig!) { connection: testConnection(projectId: $projectId, config: $config) { id connectTime serverVersion clientVersion } }";
        let variables = vars([("projectId", json!(project_id)), ("config", to_json(config)?)]);
        Ok(self
            .execute(document, JsonValue::Object(variables), "connection")
            .await?)
    }

    async fn init_connection(
        &self,
        config: &ConnectionInitConfig,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        let document = connection_document(
            "mutation initConnection",
            "$projectId: ID!, $connectionId: ID!, $credentials: Object, $networkCredentials: [NetworkHandlerConfigInput!], $saveCredentials: Boolean, $sharedCredentials: Boolean",
            "connection: initConnection(projectId: $projectId, id: $connectionId, credentials: $credentials, networkCredentials: $networkCredentials, saveCredentials: $saveCredentials, sharedCredentials: $sharedCredentials)",
        );
        let variables = match to_json(config)? {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        self.connection_call(document, variables, includes).await
    }

    async fn update_connection(
        &self,
        project_id: &str,
        config: &ConnectionConfig,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        let document = connection_document(
            "mutation updateConnection",
            "$projectId: ID!, $config: ConnectionConfig!",
            "connection: updateConnection(projectId: $projectId, config: $config)",
        );
        let variables = vars([("projectId", json!(project_id)), ("config", to_json(config)?)]);
        self.connection_call(document, variables, includes).await
    }

    async fn close_connection(&self, key: &ConnectionKey, includes: &IncludeSet) -> Result<Connection, LoadError> {
        let document = connection_document(
            "mutation closeConnection",
            "$projectId: ID!, $connectionId: ID!",
            "connection: closeConnection(projectId: $projectId, id: $connectionId)",
        );
        let variables = vars([
            ("projectId", json!(key.project_id())),
            ("connectionId", json!(key.connection_id())),
        ]);
        self.connection_call(document, variables, includes).await
    }

    async fn delete_connection(&self, key: &ConnectionKey) -> Result<(), LoadError> {
        let document = "mutation deleteConnection($projectId: ID!, $connectionId: ID!) { deleted: deleteConnection(projectId: $projectId, id: $connectionId) }";
        let variables = vars([
            ("projectId", json!(key.project_id())),
            ("connectionId", json!(key.connection_id())),
        ]);
        let _: JsonValue = self
            .execute(document, JsonValue::Object(variables), "deleted")
            .await?;
        Ok(())
    }

    async fn set_navigator_settings(
        &self,
        key: &ConnectionKey,
        settings: &NavigatorSettings,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        let document = connection_document(
            "mutation setConnectionNavigatorSettings",
            "$projectId: ID!, $connectionId: ID!, $settings: NavigatorSettingsInput!",
            "connection: setConnectionNavigatorSettings(projectId: $projectId, id: $connectionId, settings: $settings)",
        );
        let variables = vars([
            ("projectId", json!(key.project_id())),
            ("connectionId", json!(key.connection_id())),
            ("settings", to_json(settings)?),
        ]);
        self.connection_call(document, variables, includes).await
    }

    async fn get_connection_access(&self, key: &ConnectionKey) -> Result<Vec<AccessGrant>, LoadError> {
        let document = "query getConnectionAccess($projectId: ID!, $connectionId: ID) { subjects: getConnectionSubjectAccess(projectId: $projectId, connectionId: $connectionId) { dataSourceId subjectId subjectType } }";
        let variables = vars([
            ("projectId", json!(key.project_id())),
            ("connectionId", json!(key.connection_id())),
        ]);
        Ok(self
            .execute(document, JsonValue::Object(variables), "subjects")
            .await?)
    }

    async fn add_connections_access(
        &self,
        project_id: &str,
        connection_ids: &[String],
        subjects: &[String],
    ) -> Result<(), LoadError> {
        let document = "mutation addConnectionsAccess($projectId: ID!, $connectionIds: [ID!]!, $subjects: [ID!]!) { result: addConnectionsAccess(projectId: $projectId, connectionIds: $connectionIds, subjects: $subjects) }";
        let variables = vars([
            ("projectId", json!(project_id)),
            ("connectionIds", json!(connection_ids)),
            ("subjects", json!(subjects)),
        ]);
        let _: JsonValue = self
            .execute(document, JsonValue::Object(variables), "result")
            .await?;
        Ok(())
    }

    async fn delete_connections_access(
        &self,
        project_id: &str,
        connection_ids: &[String],
        subjects: &[String],
    ) -> Result<(), LoadError> {
        let document = "mutation deleteConnectionsAccess($projectId: ID!, $connectionIds: [ID!]!, $subjects: [ID!]!) { result: deleteConnectionsAccess(projectId: $projectId, connectionIds: $connectionIds, subjects: $subjects) }";
        let variables = vars([
            ("projectId", json!(project_id)),
            ("connectionIds", json!(connection_ids)),
            ("subjects", json!(subjects)),
        ]);
        let _: JsonValue = self
            .execute(document, JsonValue::Object(variables), "result")
            .await?;
        Ok(())
    }

    async fn search_databases(&self, hosts: &[String]) -> Result<Vec<DatabaseSearchResult>, LoadError> {
        let document = "query searchDatabases($hosts: [String!]!) { databases: searchDatabases(hosts: $hosts) { host port possibleDrivers defaultDriver } }";
        let variables = vars([("hosts", json!(hosts))]);
        Ok(self
            .execute(document, JsonValue::Object(variables), "databases")
            .await?)
    }

    async fn refresh_session_connections(&self) -> Result<bool, LoadError> {
        let document = "mutation refreshSessionConnections { refreshed: refreshSessionConnections }";
        Ok(self
            .execute(document, JsonValue::Object(Map::new()), "refreshed")
            .await?)
    }
}
