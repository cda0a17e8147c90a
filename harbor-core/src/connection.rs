//! Connection entity as served by the console API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::fmt;

use crate::identity::ConnectionKey;

// ============================================================================
// INCLUDE GROUPS
// ============================================================================

/// Optional field groups of a [`Connection`] that are fetched on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectionInclude {
    NetworkHandlersConfig,
    AuthProperties,
    AuthNeeded,
    CredentialsSaved,
    Properties,
    ProviderProperties,
    CustomIncludeOptions,
}

impl ConnectionInclude {
    pub const ALL: [ConnectionInclude; 7] = [
        Self::NetworkHandlersConfig,
        Self::AuthProperties,
        Self::AuthNeeded,
        Self::CredentialsSaved,
        Self::Properties,
        Self::ProviderProperties,
        Self::CustomIncludeOptions,
    ];

    /// Name of the GraphQL boolean variable that requests this group.
    pub fn variable(&self) -> &'static str {
        match self {
            Self::NetworkHandlersConfig => "includeNetworkHandlersConfig",
            Self::AuthProperties => "includeAuthProperties",
            Self::AuthNeeded => "includeAuthNeeded",
            Self::CredentialsSaved => "includeCredentialsSaved",
            Self::Properties => "includeProperties",
            Self::ProviderProperties => "includeProviderProperties",
            Self::CustomIncludeOptions => "customIncludeOptions",
        }
    }

    pub fn from_variable(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|include| include.variable() == name)
    }
}

impl fmt::Display for ConnectionInclude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.variable())
    }
}

// ============================================================================
// ENTITY
// ============================================================================

/// Navigator view settings of one connection. The default is the console's
/// initial view: nothing hidden, nothing merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigatorSettings {
    pub show_only_entities: bool,
    pub hide_folders: bool,
    pub hide_virtual_model: bool,
    pub hide_schemas: bool,
    pub merge_entities: bool,
    pub show_system_objects: bool,
    pub show_utility_objects: bool,
}

/// Partial navigator settings; unset fields keep the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NavigatorSettingsPatch {
    pub show_only_entities: Option<bool>,
    pub hide_folders: Option<bool>,
    pub hide_virtual_model: Option<bool>,
    pub hide_schemas: Option<bool>,
    pub merge_entities: Option<bool>,
    pub show_system_objects: Option<bool>,
    pub show_utility_objects: Option<bool>,
}

impl NavigatorSettings {
    pub fn apply(&self, patch: &NavigatorSettingsPatch) -> Self {
        Self {
            show_only_entities: patch.show_only_entities.unwrap_or(self.show_only_entities),
            hide_folders: patch.hide_folders.unwrap_or(self.hide_folders),
            hide_virtual_model: patch.hide_virtual_model.unwrap_or(self.hide_virtual_model),
            hide_schemas: patch.hide_schemas.unwrap_or(self.hide_schemas),
            merge_entities: patch.merge_entities.unwrap_or(self.merge_entities),
            show_system_objects: patch.show_system_objects.unwrap_or(self.show_system_objects),
            show_utility_objects: patch
                .show_utility_objects
                .unwrap_or(self.show_utility_objects),
        }
    }
}

/// SSH tunnel, proxy, or SSL handler attached to a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkHandlerConfig {
    pub id: String,
    pub enabled: Option<bool>,
    pub auth_type: Option<String>,
    pub user_name: Option<String>,
    pub save_password: Option<bool>,
    pub properties: Option<Map<String, JsonValue>>,
    pub secure_properties: Option<Map<String, JsonValue>>,
}

impl NetworkHandlerConfig {
    /// Overlay `incoming` on `self`; fields absent from `incoming` are kept.
    pub fn merged_with(&self, incoming: &NetworkHandlerConfig) -> Self {
        Self {
            id: incoming.id.clone(),
            enabled: incoming.enabled.or(self.enabled),
            auth_type: incoming.auth_type.clone().or_else(|| self.auth_type.clone()),
            user_name: incoming.user_name.clone().or_else(|| self.user_name.clone()),
            save_password: incoming.save_password.or(self.save_password),
            properties: incoming
                .properties
                .clone()
                .or_else(|| self.properties.clone()),
            secure_properties: incoming
                .secure_properties
                .clone()
                .or_else(|| self.secure_properties.clone()),
        }
    }
}

/// Authentication property of a connection's auth model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthProperty {
    pub id: String,
    pub display_name: Option<String>,
    pub value: Option<JsonValue>,
    pub features: Vec<String>,
}

/// Where a connection definition comes from (local config, cloud, etc).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOrigin {
    #[serde(rename = "type")]
    pub kind: String,
    pub sub_type: Option<String>,
    pub display_name: Option<String>,
}

/// A database connection known to the console.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub driver_id: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub node_path: Option<String>,
    #[serde(default)]
    pub navigator_settings: Option<NavigatorSettings>,
    #[serde(default)]
    pub network_handlers_config: Option<Vec<NetworkHandlerConfig>>,
    #[serde(default)]
    pub auth_properties: Option<Vec<AuthProperty>>,
    #[serde(default)]
    pub auth_needed: Option<bool>,
    #[serde(default)]
    pub credentials_saved: Option<bool>,
    #[serde(default)]
    pub properties: Option<Map<String, JsonValue>>,
    #[serde(default)]
    pub provider_properties: Option<Map<String, JsonValue>>,
    #[serde(default)]
    pub origin: Option<ConnectionOrigin>,
    /// Set by the client when the connection was created in this session.
    #[serde(skip)]
    pub is_new: bool,
    /// Client-side insertion time in unix millis; orders new connections.
    #[serde(skip)]
    pub timestamp: i64,
}

impl Connection {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.project_id.as_str(), self.id.as_str())
    }

    /// Include groups whose fields are present on this value.
    pub fn loaded_includes(&self) -> Vec<ConnectionInclude> {
        let mut includes = Vec::new();
        if self.network_handlers_config.is_some() {
            includes.push(ConnectionInclude::NetworkHandlersConfig);
        }
        if self.auth_properties.is_some() {
            includes.push(ConnectionInclude::AuthProperties);
        }
        if self.auth_needed.is_some() {
            includes.push(ConnectionInclude::AuthNeeded);
        }
        if self.credentials_saved.is_some() {
            includes.push(ConnectionInclude::CredentialsSaved);
        }
        if self.properties.is_some() {
            includes.push(ConnectionInclude::Properties);
        }
        if self.provider_properties.is_some() {
            includes.push(ConnectionInclude::ProviderProperties);
        }
        if self.origin.is_some() {
            includes.push(ConnectionInclude::CustomIncludeOptions);
        }
        includes
    }

    /// Structural merge: fields of `incoming` overwrite, include groups
    /// missing from `incoming` are kept, and network handlers are merged by id.
    pub fn merge(previous: Option<&Connection>, incoming: Connection) -> Connection {
        let Some(previous) = previous else {
            return incoming;
        };

        let network_handlers_config = incoming.network_handlers_config.map(|handlers| {
            handlers
                .into_iter()
                .map(|handler| {
                    previous
                        .network_handlers_config
                        .as_ref()
                        .and_then(|old| old.iter().find(|old| old.id == handler.id))
                        .map(|old| old.merged_with(&handler))
                        .unwrap_or(handler)
                })
                .collect()
        });

        // Server payloads carry no client marker; only `add` stamps one.
        let (is_new, timestamp) = if incoming.timestamp != 0 {
            (incoming.is_new, incoming.timestamp)
        } else {
            (previous.is_new, previous.timestamp)
        };

        Connection {
            id: incoming.id,
            project_id: incoming.project_id,
            name: incoming.name,
            driver_id: incoming.driver_id,
            connected: incoming.connected,
            template: incoming.template,
            read_only: incoming.read_only,
            description: incoming.description.or_else(|| previous.description.clone()),
            folder: incoming.folder.or_else(|| previous.folder.clone()),
            node_path: incoming.node_path.or_else(|| previous.node_path.clone()),
            navigator_settings: incoming
                .navigator_settings
                .or_else(|| previous.navigator_settings.clone()),
            network_handlers_config: network_handlers_config
                .or_else(|| previous.network_handlers_config.clone()),
            auth_properties: incoming
                .auth_properties
                .or_else(|| previous.auth_properties.clone()),
            auth_needed: incoming.auth_needed.or(previous.auth_needed),
            credentials_saved: incoming.credentials_saved.or(previous.credentials_saved),
            properties: incoming.properties.or_else(|| previous.properties.clone()),
            provider_properties: incoming
                .provider_properties
                .or_else(|| previous.provider_properties.clone()),
            origin: incoming.origin.or_else(|| previous.origin.clone()),
            is_new,
            timestamp,
        }
    }
}

/// Sort by display name.
pub fn compare_connections(a: &Connection, b: &Connection) -> Ordering {
    a.name.cmp(&b.name)
}

/// New connections first, newest first among them.
pub fn compare_new_connections(a: &Connection, b: &Connection) -> Ordering {
    match (a.is_new, b.is_new) {
        (true, true) => b.timestamp.cmp(&a.timestamp),
        (false, true) => Ordering::Greater,
        (true, false) => Ordering::Less,
        (false, false) => Ordering::Equal,
    }
}

// ============================================================================
// REQUEST / RESPONSE SHAPES
// ============================================================================

/// Connection configuration used by create and update calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub template: bool,
    pub save_credentials: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Map<String, JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_handlers_config: Option<Vec<NetworkHandlerConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, JsonValue>>,
}

impl ConnectionConfig {
    /// Blank config for a new connection.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Input of the `initConnection` mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInitConfig {
    pub project_id: String,
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Map<String, JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_credentials: Option<Vec<NetworkHandlerConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_credentials: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_credentials: Option<bool>,
}

impl ConnectionInitConfig {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.project_id.as_str(), self.connection_id.as_str())
    }
}

/// Subject granted access to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub data_source_id: String,
    pub subject_id: String,
    pub subject_type: String,
}

/// A database discovered on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSearchResult {
    pub host: String,
    pub port: i32,
    #[serde(default)]
    pub possible_drivers: Vec<String>,
    #[serde(default)]
    pub default_driver: Option<String>,
}

/// Outcome of a test connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConnectionResult {
    pub id: String,
    pub connect_time: Option<String>,
    pub server_version: Option<String>,
    pub client_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Connection {
        Connection {
            id: "c1".to_string(),
            project_id: "p1".to_string(),
            name: "Postgres".to_string(),
            driver_id: "postgres-jdbc".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_keeps_previous_include_groups() {
        let mut previous = base();
        previous.auth_needed = Some(true);
        previous.description = Some("primary".to_string());

        let mut incoming = base();
        incoming.name = "Renamed".to_string();
        incoming.credentials_saved = Some(false);

        let merged = Connection::merge(Some(&previous), incoming);
        assert_eq!(merged.name, "Renamed");
        assert_eq!(merged.auth_needed, Some(true));
        assert_eq!(merged.credentials_saved, Some(false));
        assert_eq!(merged.description.as_deref(), Some("primary"));
    }

    #[test]
    fn test_merge_network_handlers_by_id() {
        let mut previous = base();
        previous.network_handlers_config = Some(vec![
            NetworkHandlerConfig {
                id: "ssh_tunnel".to_string(),
                enabled: Some(true),
                user_name: Some("admin".to_string()),
                ..Default::default()
            },
            NetworkHandlerConfig {
                id: "proxy".to_string(),
                enabled: Some(false),
                ..Default::default()
            },
        ]);

        let mut incoming = base();
        incoming.network_handlers_config = Some(vec![NetworkHandlerConfig {
            id: "ssh_tunnel".to_string(),
            enabled: Some(false),
            ..Default::default()
        }]);

        let merged = Connection::merge(Some(&previous), incoming);
        let handlers = merged.network_handlers_config.unwrap();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].enabled, Some(false));
        assert_eq!(handlers[0].user_name.as_deref(), Some("admin"));
    }

    #[test]
    fn test_compare_new_connections_orders_newest_first() {
        let mut older = base();
        older.is_new = true;
        older.timestamp = 10;
        let mut newer = base();
        newer.is_new = true;
        newer.timestamp = 20;
        let plain = base();

        let mut list = vec![plain.clone(), older.clone(), newer.clone()];
        list.sort_by(compare_new_connections);
        assert_eq!(list[0].timestamp, 20);
        assert_eq!(list[1].timestamp, 10);
        assert!(!list[2].is_new);
    }

    #[test]
    fn test_include_variable_roundtrip() {
        for include in ConnectionInclude::ALL {
            assert_eq!(ConnectionInclude::from_variable(include.variable()), Some(include));
        }
    }

    #[test]
    fn test_navigator_patch() {
        let patch = NavigatorSettingsPatch {
            hide_folders: Some(true),
            ..Default::default()
        };
        let settings = NavigatorSettings::default().apply(&patch);
        assert!(settings.hide_folders);
        assert!(!settings.show_system_objects);
    }
}
