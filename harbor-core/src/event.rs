//! Session event types carried over the push channel.
//!
//! Every frame on the wire is a flat JSON object:
//!
//! ```text
//! { "id": "cb_datasource_deleted", "topicId": "cb_datasource", "projectId": "p1", "dataSourceIds": ["c1"] }
//! ```
//!
//! The `id` selects the payload shape. Frames with an id this client does
//! not know decode to [`EventPayload::Unknown`] instead of failing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::{keys_for_project, ConnectionKey};

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Server-originated event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEventId {
    CbDatasourceCreated,
    CbDatasourceUpdated,
    CbDatasourceDeleted,
    CbDatasourceConnected,
    CbDatasourceDisconnected,
    CbSessionWebsocketConnected,
    CbSessionState,
    CbSessionExpired,
    CbConfigChanged,
    CbObjectPermissionsUpdated,
}

impl ServerEventId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CbDatasourceCreated => "cb_datasource_created",
            Self::CbDatasourceUpdated => "cb_datasource_updated",
            Self::CbDatasourceDeleted => "cb_datasource_deleted",
            Self::CbDatasourceConnected => "cb_datasource_connected",
            Self::CbDatasourceDisconnected => "cb_datasource_disconnected",
            Self::CbSessionWebsocketConnected => "cb_session_websocket_connected",
            Self::CbSessionState => "cb_session_state",
            Self::CbSessionExpired => "cb_session_expired",
            Self::CbConfigChanged => "cb_config_changed",
            Self::CbObjectPermissionsUpdated => "cb_object_permissions_updated",
        }
    }
}

/// Client-originated event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEventId {
    CbClientTopicSubscribe,
    CbClientTopicUnsubscribe,
    CbClientProjectsActive,
}

impl ClientEventId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CbClientTopicSubscribe => "cb_client_topic_subscribe",
            Self::CbClientTopicUnsubscribe => "cb_client_topic_unsubscribe",
            Self::CbClientProjectsActive => "cb_client_projects_active",
        }
    }
}

/// Identifier of any session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventId {
    Server(ServerEventId),
    Client(ClientEventId),
    Unknown,
}

impl From<ServerEventId> for EventId {
    fn from(id: ServerEventId) -> Self {
        Self::Server(id)
    }
}

impl From<ClientEventId> for EventId {
    fn from(id: ClientEventId) -> Self {
        Self::Client(id)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => f.write_str(id.as_str()),
            Self::Client(id) => f.write_str(id.as_str()),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Server-defined topics used to scope push events.
///
/// Topics this client does not know decode to [`EventTopic::Unknown`] so
/// the rest of the frame still reaches catch-all subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTopic {
    CbDatasource,
    CbDatasourceConnection,
    CbSession,
    CbConfig,
    CbProjects,
    CbObjectPermissions,
    Unknown,
}

impl EventTopic {
    const KNOWN: [EventTopic; 6] = [
        Self::CbDatasource,
        Self::CbDatasourceConnection,
        Self::CbSession,
        Self::CbConfig,
        Self::CbProjects,
        Self::CbObjectPermissions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CbDatasource => "cb_datasource",
            Self::CbDatasourceConnection => "cb_datasource_connection",
            Self::CbSession => "cb_session",
            Self::CbConfig => "cb_config",
            Self::CbProjects => "cb_projects",
            Self::CbObjectPermissions => "cb_object_permissions",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_id(id: &str) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|topic| topic.as_str() == id)
            .unwrap_or(Self::Unknown)
    }
}

impl<'de> Deserialize<'de> for EventTopic {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = String::deserialize(deserializer)?;
        Ok(Self::from_id(&id))
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Datasources created, updated, or deleted within one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceListEvent {
    pub project_id: String,
    #[serde(default)]
    pub data_source_ids: Vec<String>,
}

impl DatasourceListEvent {
    pub fn keys(&self) -> Vec<ConnectionKey> {
        keys_for_project(&self.project_id, &self.data_source_ids)
    }
}

/// A datasource was connected or disconnected on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStateEvent {
    pub project_id: String,
    pub connection_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl ConnectionStateEvent {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.project_id.as_str(), self.connection_id.as_str())
    }
}

/// Periodic session state report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStateEvent {
    pub last_access_time: Option<i64>,
    pub remaining_time: Option<i64>,
    pub is_valid: Option<bool>,
    pub is_cache_expired: Option<bool>,
}

/// Sent by the server once the socket is bound to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebsocketConnectedEvent {
    pub application_run_id: Option<String>,
    pub server_version: Option<String>,
}

/// Object permission grants changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionsUpdatedEvent {
    pub object_id: String,
    pub sm_object_type: String,
}

/// Client report of the currently active projects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectsActiveEvent {
    pub project_ids: Vec<String>,
}

/// Typed payload, discriminated by the wire `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum EventPayload {
    #[serde(rename = "cb_datasource_created")]
    DatasourceCreated(DatasourceListEvent),
    #[serde(rename = "cb_datasource_updated")]
    DatasourceUpdated(DatasourceListEvent),
    #[serde(rename = "cb_datasource_deleted")]
    DatasourceDeleted(DatasourceListEvent),
    #[serde(rename = "cb_datasource_connected")]
    DatasourceConnected(ConnectionStateEvent),
    #[serde(rename = "cb_datasource_disconnected")]
    DatasourceDisconnected(ConnectionStateEvent),
    #[serde(rename = "cb_session_websocket_connected")]
    WebsocketConnected(WebsocketConnectedEvent),
    #[serde(rename = "cb_session_state")]
    SessionState(SessionStateEvent),
    #[serde(rename = "cb_session_expired")]
    SessionExpired,
    #[serde(rename = "cb_config_changed")]
    ConfigChanged,
    #[serde(rename = "cb_object_permissions_updated")]
    PermissionsUpdated(PermissionsUpdatedEvent),
    #[serde(rename = "cb_client_topic_subscribe")]
    TopicSubscribe,
    #[serde(rename = "cb_client_topic_unsubscribe")]
    TopicUnsubscribe,
    #[serde(rename = "cb_client_projects_active")]
    ProjectsActive(ProjectsActiveEvent),
    #[serde(other)]
    Unknown,
}

/// One frame on the session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "topicId", default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<EventTopic>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SessionEvent {
    pub fn new(topic_id: Option<EventTopic>, payload: EventPayload) -> Self {
        Self { topic_id, payload }
    }

    pub fn topic_subscribe(topic: EventTopic) -> Self {
        Self::new(Some(topic), EventPayload::TopicSubscribe)
    }

    pub fn topic_unsubscribe(topic: EventTopic) -> Self {
        Self::new(Some(topic), EventPayload::TopicUnsubscribe)
    }

    pub fn datasource_created(project_id: &str, ids: &[&str]) -> Self {
        Self::new(
            Some(EventTopic::CbDatasource),
            EventPayload::DatasourceCreated(datasource_list(project_id, ids)),
        )
    }

    pub fn datasource_updated(project_id: &str, ids: &[&str]) -> Self {
        Self::new(
            Some(EventTopic::CbDatasource),
            EventPayload::DatasourceUpdated(datasource_list(project_id, ids)),
        )
    }

    pub fn datasource_deleted(project_id: &str, ids: &[&str]) -> Self {
        Self::new(
            Some(EventTopic::CbDatasource),
            EventPayload::DatasourceDeleted(datasource_list(project_id, ids)),
        )
    }

    pub fn datasource_connected(project_id: &str, connection_id: &str) -> Self {
        Self::new(
            Some(EventTopic::CbDatasourceConnection),
            EventPayload::DatasourceConnected(connection_state(project_id, connection_id)),
        )
    }

    pub fn datasource_disconnected(project_id: &str, connection_id: &str) -> Self {
        Self::new(
            Some(EventTopic::CbDatasourceConnection),
            EventPayload::DatasourceDisconnected(connection_state(project_id, connection_id)),
        )
    }

    pub fn websocket_connected() -> Self {
        Self::new(
            Some(EventTopic::CbSession),
            EventPayload::WebsocketConnected(WebsocketConnectedEvent::default()),
        )
    }

    pub fn id(&self) -> EventId {
        match &self.payload {
            EventPayload::DatasourceCreated(_) => ServerEventId::CbDatasourceCreated.into(),
            EventPayload::DatasourceUpdated(_) => ServerEventId::CbDatasourceUpdated.into(),
            EventPayload::DatasourceDeleted(_) => ServerEventId::CbDatasourceDeleted.into(),
            EventPayload::DatasourceConnected(_) => ServerEventId::CbDatasourceConnected.into(),
            EventPayload::DatasourceDisconnected(_) => {
                ServerEventId::CbDatasourceDisconnected.into()
            }
            EventPayload::WebsocketConnected(_) => {
                ServerEventId::CbSessionWebsocketConnected.into()
            }
            EventPayload::SessionState(_) => ServerEventId::CbSessionState.into(),
            EventPayload::SessionExpired => ServerEventId::CbSessionExpired.into(),
            EventPayload::ConfigChanged => ServerEventId::CbConfigChanged.into(),
            EventPayload::PermissionsUpdated(_) => {
                ServerEventId::CbObjectPermissionsUpdated.into()
            }
            EventPayload::TopicSubscribe => ClientEventId::CbClientTopicSubscribe.into(),
            EventPayload::TopicUnsubscribe => ClientEventId::CbClientTopicUnsubscribe.into(),
            EventPayload::ProjectsActive(_) => ClientEventId::CbClientProjectsActive.into(),
            EventPayload::Unknown => EventId::Unknown,
        }
    }

    /// Connection keys this event refers to, if any.
    pub fn connection_keys(&self) -> Vec<ConnectionKey> {
        match &self.payload {
            EventPayload::DatasourceCreated(event)
            | EventPayload::DatasourceUpdated(event)
            | EventPayload::DatasourceDeleted(event) => event.keys(),
            EventPayload::DatasourceConnected(event)
            | EventPayload::DatasourceDisconnected(event) => vec![event.key()],
            _ => Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

fn datasource_list(project_id: &str, ids: &[&str]) -> DatasourceListEvent {
    DatasourceListEvent {
        project_id: project_id.to_string(),
        data_source_ids: ids.iter().map(|id| id.to_string()).collect(),
    }
}

fn connection_state(project_id: &str, connection_id: &str) -> ConnectionStateEvent {
    ConnectionStateEvent {
        project_id: project_id.to_string(),
        connection_id: connection_id.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_datasource_deleted() {
        let frame = r#"{"id":"cb_datasource_deleted","topicId":"cb_datasource","projectId":"p1","dataSourceIds":["c1","c2"]}"#;
        let event = SessionEvent::decode(frame).unwrap();
        assert_eq!(event.id(), EventId::Server(ServerEventId::CbDatasourceDeleted));
        assert_eq!(event.topic_id, Some(EventTopic::CbDatasource));
        assert_eq!(
            event.connection_keys(),
            vec![ConnectionKey::new("p1", "c1"), ConnectionKey::new("p1", "c2")]
        );
    }

    #[test]
    fn test_topic_subscribe_frame_shape() {
        let frame = SessionEvent::topic_subscribe(EventTopic::CbDatasourceConnection)
            .encode()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"id": "cb_client_topic_subscribe", "topicId": "cb_datasource_connection"})
        );
    }

    #[test]
    fn test_unknown_id_is_not_an_error() {
        let event = SessionEvent::decode(r#"{"id":"cb_rm_resource_updated","resourcePath":"x"}"#)
            .unwrap();
        assert_eq!(event.id(), EventId::Unknown);
        assert_eq!(event.topic_id, None);
    }

    #[test]
    fn test_unknown_topic_keeps_the_frame() {
        let event = SessionEvent::decode(
            r#"{"id":"cb_rm_resource_updated","topicId":"cb_rm_resource","resourcePath":"x"}"#,
        )
        .unwrap();
        assert_eq!(event.topic_id, Some(EventTopic::Unknown));
        assert_eq!(event.id(), EventId::Unknown);

        let known = SessionEvent::decode(r#"{"id":"cb_session_expired","topicId":"cb_session"}"#).unwrap();
        assert_eq!(known.topic_id, Some(EventTopic::CbSession));
    }

    #[test]
    fn test_session_state_defaults_missing_fields() {
        let event =
            SessionEvent::decode(r#"{"id":"cb_session_state","topicId":"cb_session","isValid":false}"#)
                .unwrap();
        match event.payload {
            EventPayload::SessionState(state) => {
                assert_eq!(state.is_valid, Some(false));
                assert_eq!(state.remaining_time, None);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_connection_state_key() {
        let event = SessionEvent::datasource_disconnected("p1", "c9");
        assert_eq!(event.connection_keys(), vec![ConnectionKey::new("p1", "c9")]);
        assert_eq!(event.id().to_string(), "cb_datasource_disconnected");
    }
}
