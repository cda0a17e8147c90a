//! Harbor Test Utilities
//!
//! Shared test infrastructure for the harbor workspace:
//! - An in-memory connection service and synchronization stub
//! - A scripted socket connector for driving the event transport
//! - Proptest generators for keys and connections
//! - Fixtures for common scenarios

pub use harbor_connections::{
    ActiveProjects, ConnectionInfoResource, ConnectionQuery, ConnectionService, DataSynchronization,
};
pub use harbor_core::{
    AccessGrant, Connection, ConnectionConfig, ConnectionInclude, ConnectionInitConfig, ConnectionOrigin,
    ConnectionKey, DatabaseSearchResult, EventTopic, LoadError, NavigatorSettings, SessionEvent,
    TestConnectionResult, TransportError,
};
pub use harbor_events::{Connector, SocketLink, SocketSignal};
pub use harbor_storage::IncludeSet;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Let spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// MOCK CONNECTION SERVICE
// ============================================================================

/// In-memory [`ConnectionService`].
///
/// Stores connections, records every call by operation name, and strips
/// include groups the caller did not ask for, the way the server does.
#[derive(Default)]
pub struct MockConnectionService {
    connections: Mutex<Vec<Connection>>,
    grants: Mutex<Vec<AccessGrant>>,
    calls: Mutex<Vec<&'static str>>,
    queries: Mutex<Vec<ConnectionQuery>>,
    failure: Mutex<Option<LoadError>>,
    latency: Mutex<Option<Duration>>,
    refresh_result: AtomicBool,
    next_id: AtomicUsize,
}

impl MockConnectionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections(connections: impl IntoIterator<Item = Connection>) -> Self {
        let service = Self::new();
        for connection in connections {
            service.insert(connection);
        }
        service
    }

    /// Add or replace a server-side connection.
    pub fn insert(&self, connection: Connection) {
        let mut connections = locked(&self.connections);
        connections.retain(|c| c.key() != connection.key());
        connections.push(connection);
    }

    pub fn remove(&self, key: &ConnectionKey) {
        locked(&self.connections).retain(|c| &c.key() != key);
    }

    pub fn set_connected(&self, key: &ConnectionKey, connected: bool) {
        for connection in locked(&self.connections).iter_mut() {
            if &connection.key() == key {
                connection.connected = connected;
            }
        }
    }

    /// Make every following call fail with `error` (or succeed again with `None`).
    pub fn fail_with(&self, error: Option<LoadError>) {
        *locked(&self.failure) = error;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *locked(&self.latency) = Some(latency);
    }

    pub fn set_refresh_result(&self, changed: bool) {
        self.refresh_result.store(changed, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        locked(&self.calls).clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        locked(&self.calls).iter().filter(|call| **call == operation).count()
    }

    /// Every `get_user_connections` query, in call order.
    pub fn queries(&self) -> Vec<ConnectionQuery> {
        locked(&self.queries).clone()
    }

    async fn enter(&self, operation: &'static str) -> Result<(), LoadError> {
        locked(&self.calls).push(operation);
        let latency = *locked(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match locked(&self.failure).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> String {
        format!("conn-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn store(&self, connection: Connection, includes: &IncludeSet) -> Connection {
        self.insert(connection.clone());
        shape(connection, includes)
    }

    fn update<F>(&self, key: &ConnectionKey, includes: &IncludeSet, change: F) -> Result<Connection, LoadError>
    where
        F: FnOnce(&mut Connection),
    {
        let mut connections = locked(&self.connections);
        let connection = connections
            .iter_mut()
            .find(|c| &c.key() == key)
            .ok_or_else(|| LoadError::NotFound(format!("Connection is not found ({})", key.connection_id())))?;
        change(connection);
        Ok(shape(connection.clone(), includes))
    }
}

/// Drop include groups that were not requested.
fn shape(mut connection: Connection, includes: &IncludeSet) -> Connection {
    for include in ConnectionInclude::ALL {
        if includes.contains(include.variable()) {
            continue;
        }
        match include {
            ConnectionInclude::NetworkHandlersConfig => connection.network_handlers_config = None,
            ConnectionInclude::AuthProperties => connection.auth_properties = None,
            ConnectionInclude::AuthNeeded => connection.auth_needed = None,
            ConnectionInclude::CredentialsSaved => connection.credentials_saved = None,
            ConnectionInclude::Properties => connection.properties = None,
            ConnectionInclude::ProviderProperties => connection.provider_properties = None,
            ConnectionInclude::CustomIncludeOptions => connection.origin = None,
        }
    }
    connection
}

#[async_trait]
impl ConnectionService for MockConnectionService {
    async fn get_user_connections(&self, query: &ConnectionQuery) -> Result<Vec<Connection>, LoadError> {
        locked(&self.queries).push(query.clone());
        self.enter("get_user_connections").await?;
        Ok(locked(&self.connections)
            .iter()
            .filter(|c| query.project_id.as_ref().map_or(true, |id| &c.project_id == id))
            .filter(|c| query.connection_id.as_ref().map_or(true, |id| &c.id == id))
            .filter(|c| query.project_ids.as_ref().map_or(true, |ids| ids.contains(&c.project_id)))
            .cloned()
            .map(|c| shape(c, &query.includes))
            .collect())
    }

    async fn create_connection(
        &self,
        project_id: &str,
        config: &ConnectionConfig,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        self.enter("create_connection").await?;
        let connection = Connection {
            id: config.connection_id.clone().unwrap_or_else(|| self.next_id()),
            project_id: project_id.to_string(),
            name: config.name.clone().unwrap_or_default(),
            driver_id: config.driver_id.clone().unwrap_or_default(),
            template: config.template,
            description: config.description.clone(),
            folder: config.folder.clone(),
            ..Default::default()
        };
        Ok(self.store(connection, includes))
    }

    async fn create_connection_from_template(
        &self,
        project_id: &str,
        template_id: &str,
        connection_name: &str,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        self.enter("create_connection_from_template").await?;
        let driver_id = locked(&self.connections)
            .iter()
            .find(|c| c.id == template_id)
            .map(|c| c.driver_id.clone())
            .unwrap_or_default();
        let connection = Connection {
            id: self.next_id(),
            project_id: project_id.to_string(),
            name: connection_name.to_string(),
            driver_id,
            ..Default::default()
        };
        Ok(self.store(connection, includes))
    }

    async fn create_connection_from_node(
        &self,
        project_id: &str,
        node_path: &str,
        name: &str,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        self.enter("create_connection_from_node").await?;
        let id = self.next_id();
        let connection = Connection {
            node_path: Some(format!("database://{id}")),
            id,
            project_id: project_id.to_string(),
            name: name.to_string(),
            description: Some(format!("copy of {node_path}")),
            ..Default::default()
        };
        Ok(self.store(connection, includes))
    }

    async fn test_connection(
        &self,
        _project_id: &str,
        config: &ConnectionConfig,
    ) -> Result<TestConnectionResult, LoadError> {
        self.enter("test_connection").await?;
        Ok(TestConnectionResult {
            id: config.connection_id.clone().unwrap_or_default(),
            connect_time: Some("12 ms".to_string()),
            server_version: Some("mock 1.0".to_string()),
            client_version: Some("mock-driver 1.0".to_string()),
        })
    }

    async fn init_connection(
        &self,
        config: &ConnectionInitConfig,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        self.enter("init_connection").await?;
        let saved = config.save_credentials.unwrap_or(false);
        self.update(&config.key(), includes, |c| {
            c.connected = true;
            if saved {
                c.credentials_saved = Some(true);
            }
        })
    }

    async fn update_connection(
        &self,
        project_id: &str,
        config: &ConnectionConfig,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        self.enter("update_connection").await?;
        let id = config
            .connection_id
            .as_deref()
            .ok_or_else(|| LoadError::Validation("connectionId is required".to_string()))?;
        self.update(&ConnectionKey::new(project_id, id), includes, |c| {
            if let Some(name) = &config.name {
                c.name = name.clone();
            }
            if let Some(description) = &config.description {
                c.description = Some(description.clone());
            }
            if let Some(folder) = &config.folder {
                c.folder = Some(folder.clone());
            }
        })
    }

    async fn close_connection(&self, key: &ConnectionKey, includes: &IncludeSet) -> Result<Connection, LoadError> {
        self.enter("close_connection").await?;
        self.update(key, includes, |c| c.connected = false)
    }

    async fn delete_connection(&self, key: &ConnectionKey) -> Result<(), LoadError> {
        self.enter("delete_connection").await?;
        let mut connections = locked(&self.connections);
        let before = connections.len();
        connections.retain(|c| &c.key() != key);
        if connections.len() == before {
            return Err(LoadError::NotFound(format!(
                "Connection is not found ({})",
                key.connection_id()
            )));
        }
        Ok(())
    }

    async fn set_navigator_settings(
        &self,
        key: &ConnectionKey,
        settings: &NavigatorSettings,
        includes: &IncludeSet,
    ) -> Result<Connection, LoadError> {
        self.enter("set_navigator_settings").await?;
        self.update(key, includes, |c| c.navigator_settings = Some(settings.clone()))
    }

    async fn get_connection_access(&self, key: &ConnectionKey) -> Result<Vec<AccessGrant>, LoadError> {
        self.enter("get_connection_access").await?;
        Ok(locked(&self.grants)
            .iter()
            .filter(|grant| grant.data_source_id == key.connection_id())
            .cloned()
            .collect())
    }

    async fn add_connections_access(
        &self,
        _project_id: &str,
        connection_ids: &[String],
        subjects: &[String],
    ) -> Result<(), LoadError> {
        self.enter("add_connections_access").await?;
        let mut grants = locked(&self.grants);
        for connection_id in connection_ids {
            for subject in subjects {
                grants.push(AccessGrant {
                    data_source_id: connection_id.clone(),
                    subject_id: subject.clone(),
                    subject_type: "user".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn delete_connections_access(
        &self,
        _project_id: &str,
        connection_ids: &[String],
        subjects: &[String],
    ) -> Result<(), LoadError> {
        self.enter("delete_connections_access").await?;
        locked(&self.grants).retain(|grant| {
            !(connection_ids.contains(&grant.data_source_id) && subjects.contains(&grant.subject_id))
        });
        Ok(())
    }

    async fn search_databases(&self, hosts: &[String]) -> Result<Vec<DatabaseSearchResult>, LoadError> {
        self.enter("search_databases").await?;
        Ok(hosts
            .iter()
            .map(|host| DatabaseSearchResult {
                host: host.clone(),
                port: 5432,
                possible_drivers: vec!["postgres-jdbc".to_string()],
                default_driver: Some("postgres-jdbc".to_string()),
            })
            .collect())
    }

    async fn refresh_session_connections(&self) -> Result<bool, LoadError> {
        self.enter("refresh_session_connections").await?;
        Ok(self.refresh_result.load(Ordering::SeqCst))
    }
}

// ============================================================================
// MOCK SYNCHRONIZATION
// ============================================================================

/// [`DataSynchronization`] with a fixed answer that records every request.
pub struct MockSynchronization {
    proceed: AtomicBool,
    requests: Mutex<Vec<(String, String)>>,
}

impl MockSynchronization {
    pub fn new(proceed: bool) -> Self {
        Self {
            proceed: AtomicBool::new(proceed),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_proceed(&self, proceed: bool) {
        self.proceed.store(proceed, Ordering::SeqCst);
    }

    /// `(kind, description)` of every request.
    pub fn requests(&self) -> Vec<(String, String)> {
        locked(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        locked(&self.requests).len()
    }
}

#[async_trait]
impl DataSynchronization for MockSynchronization {
    async fn request_synchronization(&self, kind: &str, description: &str) -> bool {
        locked(&self.requests).push((kind.to_string(), description.to_string()));
        self.proceed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SCRIPTED CONNECTOR
// ============================================================================

struct ScriptedSocket {
    signals: mpsc::UnboundedSender<SocketSignal>,
    outbound: mpsc::UnboundedReceiver<String>,
    written: Vec<String>,
}

/// In-memory [`Connector`]. Every connect attempt creates a socket the test
/// drives by index: open it, push frames, close it, and read what the
/// transport wrote.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    sockets: std::sync::Arc<Mutex<Vec<ScriptedSocket>>>,
    refuse: std::sync::Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connect attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Sockets created so far.
    pub fn attempts(&self) -> usize {
        locked(&self.sockets).len()
    }

    pub fn signal(&self, socket: usize, signal: SocketSignal) {
        if let Some(socket) = locked(&self.sockets).get(socket) {
            let _ = socket.signals.send(signal);
        }
    }

    pub fn open(&self, socket: usize) {
        self.signal(socket, SocketSignal::Opened);
    }

    pub fn push(&self, socket: usize, event: &SessionEvent) {
        if let Ok(frame) = event.encode() {
            self.signal(socket, SocketSignal::Text(frame));
        }
    }

    pub fn close(&self, socket: usize, code: u16, reason: &str) {
        self.signal(
            socket,
            SocketSignal::Closed {
                code,
                reason: reason.to_string(),
            },
        );
    }

    /// Every frame the transport wrote to `socket` so far.
    pub fn written(&self, socket: usize) -> Vec<String> {
        let mut sockets = locked(&self.sockets);
        let Some(socket) = sockets.get_mut(socket) else {
            return Vec::new();
        };
        while let Ok(frame) = socket.outbound.try_recv() {
            socket.written.push(frame);
        }
        socket.written.clone()
    }

    pub fn written_events(&self, socket: usize) -> Vec<SessionEvent> {
        self.written(socket)
            .iter()
            .filter_map(|frame| SessionEvent::decode(frame).ok())
            .collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<SocketLink, TransportError> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (signals, inbound) = mpsc::unbounded_channel();
        locked(&self.sockets).push(ScriptedSocket {
            signals,
            outbound: outbound_rx,
            written: Vec::new(),
        });
        Ok(SocketLink { outbound, inbound })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for harbor types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_project_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,11}"
    }

    /// Connection ids may contain the key separator.
    pub fn arb_connection_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9:._-]{0,15}"
    }

    pub fn arb_connection_key() -> impl Strategy<Value = ConnectionKey> {
        (arb_project_id(), arb_connection_id()).prop_map(|(p, c)| ConnectionKey::new(p, c))
    }

    pub fn arb_navigator_settings() -> impl Strategy<Value = NavigatorSettings> {
        any::<[bool; 7]>().prop_map(|flags| NavigatorSettings {
            show_only_entities: flags[0],
            hide_folders: flags[1],
            hide_virtual_model: flags[2],
            hide_schemas: flags[3],
            merge_entities: flags[4],
            show_system_objects: flags[5],
            show_utility_objects: flags[6],
        })
    }

    /// Connection with a random subset of include groups present.
    pub fn arb_connection() -> impl Strategy<Value = Connection> {
        (
            arb_connection_key(),
            "[A-Za-z0-9 ]{1,24}",
            any::<bool>(),
            prop::option::of("[a-z ]{0,40}"),
            prop::option::of(arb_navigator_settings()),
            prop::option::of(any::<bool>()),
            prop::option::of(any::<bool>()),
        )
            .prop_map(
                |(key, name, connected, description, navigator_settings, auth_needed, credentials_saved)| {
                    Connection {
                        id: key.connection_id().to_string(),
                        project_id: key.project_id().to_string(),
                        name,
                        driver_id: "postgres-jdbc".to_string(),
                        connected,
                        description,
                        navigator_settings,
                        auth_needed,
                        credentials_saved,
                        ..Default::default()
                    }
                },
            )
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;
    use harbor_events::{EventTransport, SessionCollaborators, TransportConfig};
    use harbor_storage::CacheConfig;
    use std::sync::Arc;

    pub fn connection(project_id: &str, id: &str, name: &str) -> Connection {
        Connection {
            id: id.to_string(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            driver_id: "postgres-jdbc".to_string(),
            ..Default::default()
        }
    }

    pub fn connected_connection(project_id: &str, id: &str, name: &str) -> Connection {
        Connection {
            connected: true,
            ..connection(project_id, id, name)
        }
    }

    /// Connection with every include group populated.
    pub fn detailed_connection(project_id: &str, id: &str, name: &str) -> Connection {
        let mut properties = serde_json::Map::new();
        properties.insert("ssl".to_string(), serde_json::Value::Bool(true));
        Connection {
            auth_needed: Some(false),
            credentials_saved: Some(true),
            properties: Some(properties.clone()),
            provider_properties: Some(properties),
            auth_properties: Some(Vec::new()),
            network_handlers_config: Some(Vec::new()),
            origin: Some(ConnectionOrigin {
                kind: "local".to_string(),
                ..Default::default()
            }),
            ..connection(project_id, id, name)
        }
    }

    /// Resource over `service` with `projects` active.
    pub fn resource(service: Arc<MockConnectionService>, projects: &[&str]) -> ConnectionInfoResource {
        ConnectionInfoResource::new(
            service as Arc<dyn ConnectionService>,
            ActiveProjects::new(projects.iter().copied()),
            CacheConfig::default(),
        )
    }

    /// Transport over `connector` with default collaborators and timings.
    pub fn transport(connector: &ScriptedConnector) -> EventTransport {
        EventTransport::spawn(
            connector.clone(),
            SessionCollaborators::default(),
            TransportConfig::default(),
        )
    }
}
