//! Connection info resource: the connection cache plus the server
//! operations that keep it current.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use futures_util::Stream;
use harbor_core::{
    AccessGrant, Connection, ConnectionConfig, ConnectionInclude, ConnectionInitConfig,
    ConnectionKey, DatabaseSearchResult, LoadError, NavigatorSettingsPatch, TestConnectionResult,
};
use harbor_storage::{
    CacheConfig, CacheObserver, IncludeSet, KeyedCache, ResourceAlias, ResourceEvent, ResourceKey,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::loader::{ConnectionLoader, ACTIVE_PROJECTS_ALIAS, PROJECTS_ALIAS};
use crate::projects::ActiveProjects;
use crate::service::ConnectionService;

const DATABASE_NODE_PREFIX: &str = "database://";

/// Per-entry extension metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// An `init` call for this connection is in flight.
    pub connecting: bool,
}

/// Data derived from connections changed on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOutdated {
    Key(ConnectionKey),
    All,
}

/// Include set made of the given groups.
pub fn includes(groups: &[ConnectionInclude]) -> IncludeSet {
    groups.iter().map(|group| group.variable()).collect()
}

/// Connections of the given projects.
pub fn project_key<I, S>(project_ids: I) -> ResourceKey<ConnectionKey>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ResourceKey::alias(ResourceAlias::with_params(PROJECTS_ALIAS, project_ids))
}

/// Connections of the active projects.
pub fn active_projects_key() -> ResourceKey<ConnectionKey> {
    ResourceKey::alias(ResourceAlias::new(ACTIVE_PROJECTS_ALIAS))
}

/// `database://<connection>` part of a navigator node id.
fn connection_node_path(node_id: &str) -> Option<&str> {
    let rest = node_id.strip_prefix(DATABASE_NODE_PREFIX)?;
    let end = rest
        .find('/')
        .map(|index| DATABASE_NODE_PREFIX.len() + index)
        .unwrap_or(node_id.len());
    Some(&node_id[..end])
}

/// Ends a session update once a load has been fully applied, so stale keys
/// dropped by that load are removed silently.
struct SessionUpdateReset(Arc<AtomicBool>);

impl CacheObserver<Connection> for SessionUpdateReset {
    fn on_loaded(&self) {
        if self.0.swap(false, Ordering::SeqCst) {
            debug!("Session update finished");
        }
    }
}

/// Navigator node path to connection key.
#[derive(Default)]
struct NodePathIndex {
    paths: RwLock<HashMap<String, ConnectionKey>>,
}

impl NodePathIndex {
    fn get(&self, path: &str) -> Option<ConnectionKey> {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

impl CacheObserver<Connection> for NodePathIndex {
    fn on_set(&self, key: &ConnectionKey, value: &Connection) {
        if let Some(path) = &value.node_path {
            self.paths
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(path.clone(), key.clone());
        }
    }

    fn on_delete(&self, _key: &ConnectionKey, previous: Option<&Connection>) {
        if let Some(path) = previous.and_then(|connection| connection.node_path.as_ref()) {
            self.paths
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(path);
        }
    }

    fn on_clear(&self) {
        self.paths.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Clears the `connecting` flag however the init call ends.
struct ConnectingGuard<'a> {
    cache: &'a KeyedCache<Connection, ConnectionMetadata>,
    key: &'a ConnectionKey,
}

impl<'a> ConnectingGuard<'a> {
    fn start(cache: &'a KeyedCache<Connection, ConnectionMetadata>, key: &'a ConnectionKey) -> Self {
        cache.update_metadata(key, |meta| meta.ext.connecting = true);
        Self { cache, key }
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.cache
            .update_metadata(self.key, |meta| meta.ext.connecting = false);
    }
}

fn notifications<E, T, F>(
    receiver: broadcast::Receiver<E>,
    mut select: F,
) -> impl Stream<Item = T> + Send + Unpin + 'static
where
    E: Clone + Send + 'static,
    T: 'static,
    F: FnMut(E) -> Option<T> + Send + Unpin + 'static,
{
    BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(event) => select(event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "Connection notification subscriber lagged");
            None
        }
    })
}

/// Cache of every connection the user can see.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct ConnectionInfoResource {
    cache: KeyedCache<Connection, ConnectionMetadata>,
    service: Arc<dyn ConnectionService>,
    session_update: Arc<AtomicBool>,
    active_projects: ActiveProjects,
    nodes: Arc<NodePathIndex>,
    created: broadcast::Sender<Connection>,
}

impl ConnectionInfoResource {
    pub fn new(
        service: Arc<dyn ConnectionService>,
        active_projects: ActiveProjects,
        config: CacheConfig,
    ) -> Self {
        let session_update = Arc::new(AtomicBool::new(false));
        let loader = ConnectionLoader::new(Arc::clone(&service), active_projects.clone());
        let (created, _) = broadcast::channel(config.notify_capacity.max(1));
        let cache = KeyedCache::new(Arc::new(loader), config);

        cache.aliases().add(PROJECTS_ALIAS, |alias, keys| {
            keys.iter()
                .filter(|key| alias.params().iter().any(|id| id == key.project_id()))
                .cloned()
                .collect()
        });
        let active = active_projects.clone();
        cache.aliases().add(ACTIVE_PROJECTS_ALIAS, move |_, keys| {
            keys.iter()
                .filter(|key| active.contains(key.project_id()))
                .cloned()
                .collect()
        });

        // Dependents refresh through the session update itself.
        let updating = Arc::clone(&session_update);
        cache.add_interrupter(move |event| {
            matches!(event, ResourceEvent::Deleted(_)) && updating.load(Ordering::SeqCst)
        });

        let nodes = Arc::new(NodePathIndex::default());
        cache.add_observer(Arc::clone(&nodes) as Arc<dyn CacheObserver<Connection>>);
        cache.add_observer(Arc::new(SessionUpdateReset(Arc::clone(&session_update)))
            as Arc<dyn CacheObserver<Connection>>);

        Self {
            cache,
            service,
            session_update,
            active_projects,
            nodes,
            created,
        }
    }

    pub fn cache(&self) -> &KeyedCache<Connection, ConnectionMetadata> {
        &self.cache
    }

    pub fn active_projects(&self) -> &ActiveProjects {
        &self.active_projects
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Connection> {
        self.cache.get(key)
    }

    pub async fn load(
        &self,
        key: &ResourceKey<ConnectionKey>,
        includes: &IncludeSet,
    ) -> Result<Vec<Connection>, LoadError> {
        self.cache.load(key, includes).await
    }

    pub async fn load_one(&self, key: &ConnectionKey, includes: &IncludeSet) -> Result<Connection, LoadError> {
        self.cache.load_one(key, includes).await
    }

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    /// Connections that appeared in the cache. Silent during a session update.
    pub fn on_connection_create(&self) -> impl Stream<Item = Connection> + Send + Unpin + 'static {
        notifications(self.created.subscribe(), Some)
    }

    /// Connections that went from connected to disconnected.
    pub fn on_connection_close(&self) -> impl Stream<Item = ConnectionKey> + Send + Unpin + 'static {
        notifications(self.cache.subscribe(), |event| match event {
            ResourceEvent::Closed(key) => Some(key),
            _ => None,
        })
    }

    /// Connections removed from the cache. Silent during a session update.
    pub fn on_item_delete(&self) -> impl Stream<Item = ConnectionKey> + Send + Unpin + 'static {
        notifications(self.cache.subscribe(), |event| match event {
            ResourceEvent::Deleted(key) => Some(key),
            _ => None,
        })
    }

    pub fn on_data_outdated(&self) -> impl Stream<Item = DataOutdated> + Send + Unpin + 'static {
        notifications(self.cache.subscribe(), |event| match event {
            ResourceEvent::Outdated(key) => Some(DataOutdated::Key(key)),
            ResourceEvent::AllOutdated => Some(DataOutdated::All),
            _ => None,
        })
    }

    /// Announce `connection` to creation listeners.
    pub fn notify_created(&self, connection: Connection) {
        if self.is_session_update() {
            debug!(key = ?connection.key(), "Session update in progress, creation not announced");
            return;
        }
        // No receivers is fine.
        let _ = self.created.send(connection);
    }

    fn notify_data_outdated(&self, key: &ConnectionKey) {
        self.cache.notify(ResourceEvent::Outdated(key.clone()));
    }

    // ========================================================================
    // STATE
    // ========================================================================

    /// Every connection `key` resolves to is cached and connected.
    pub fn is_connected(&self, key: &ResourceKey<ConnectionKey>) -> bool {
        self.cache.resolve(key).iter().all(|key| {
            self.cache
                .get(key)
                .map(|connection| connection.connected)
                .unwrap_or(false)
        })
    }

    /// Some connection `key` resolves to has an `init` in flight.
    pub fn is_connecting(&self, key: &ResourceKey<ConnectionKey>) -> bool {
        self.cache
            .resolve(key)
            .iter()
            .any(|key| self.cache.metadata(key).ext.connecting)
    }

    /// The session was refreshed and no load has completed since. Connected
    /// flags may be stale until then.
    pub fn is_session_update(&self) -> bool {
        self.session_update.load(Ordering::SeqCst)
    }

    /// Connection owning the navigator node `node_id`.
    pub fn get_connection_for_node(&self, node_id: &str) -> Option<Connection> {
        let path = connection_node_path(node_id)?;
        let key = self.nodes.get(path)?;
        self.cache.get(&key)
    }

    fn includes_for(&self, key: Option<&ConnectionKey>) -> IncludeSet {
        key.map(|key| self.cache.metadata(key).includes)
            .unwrap_or_else(IncludeSet::empty)
    }

    fn current(&self, key: &ConnectionKey) -> Result<Connection, LoadError> {
        self.cache.get(key).ok_or_else(|| {
            LoadError::NotFound(format!("Connection is not found ({})", key.connection_id()))
        })
    }

    // ========================================================================
    // CREATION
    // ========================================================================

    pub async fn create(&self, project_id: &str, config: &ConnectionConfig) -> Result<Connection, LoadError> {
        let key = config
            .connection_id
            .as_deref()
            .map(|id| ConnectionKey::new(project_id, id));
        let includes = self.includes_for(key.as_ref());
        let connection = self
            .service
            .create_connection(project_id, config, &includes)
            .await?;
        self.add(connection, true)
    }

    pub async fn create_from_template(
        &self,
        project_id: &str,
        template_id: &str,
        connection_name: &str,
    ) -> Result<Connection, LoadError> {
        let connection = self
            .service
            .create_connection_from_template(project_id, template_id, connection_name, &IncludeSet::empty())
            .await?;
        self.add(connection, false)
    }

    pub async fn create_from_node(
        &self,
        project_id: &str,
        node_path: &str,
        name: &str,
    ) -> Result<Connection, LoadError> {
        let connection = self
            .service
            .create_connection_from_node(project_id, node_path, name, &IncludeSet::empty())
            .await?;
        self.add(connection, false)
    }

    /// Store `connection`, stamped with the current time, and announce it
    /// when its key was not cached before.
    pub fn add(&self, connection: Connection, is_new: bool) -> Result<Connection, LoadError> {
        let key = connection.key();
        key.validate()?;
        let exists = self.cache.has(&key);

        let stamped = Connection {
            is_new,
            timestamp: Utc::now().timestamp_millis(),
            ..connection
        };
        let stored = self.cache.set(stamped).ok_or_else(|| {
            LoadError::NotFound(format!("Connection is not found ({})", key.connection_id()))
        })?;
        if !exists {
            self.notify_created(stored.clone());
        }
        Ok(stored)
    }

    /// Store several connections at once, announcing the ones not cached
    /// before.
    pub fn add_list(&self, connections: Vec<Connection>) -> Vec<Connection> {
        let fresh: Vec<ConnectionKey> = connections
            .iter()
            .map(Connection::key)
            .filter(|key| !self.cache.has(key))
            .collect();
        let stored = self.cache.set_many(connections);
        for connection in &stored {
            if fresh.contains(&connection.key()) {
                self.notify_created(connection.clone());
            }
        }
        stored
    }

    // ========================================================================
    // SERVER OPERATIONS
    // ========================================================================

    pub async fn test(&self, project_id: &str, config: &ConnectionConfig) -> Result<TestConnectionResult, LoadError> {
        self.service.test_connection(project_id, config).await
    }

    pub async fn search_databases(&self, hosts: &[String]) -> Result<Vec<DatabaseSearchResult>, LoadError> {
        self.service.search_databases(hosts).await
    }

    pub async fn load_access_subjects(&self, key: &ConnectionKey) -> Result<Vec<AccessGrant>, LoadError> {
        let subjects = self
            .cache
            .perform_update(key, self.service.get_connection_access(key))
            .await?;
        self.notify_data_outdated(key);
        Ok(subjects)
    }

    pub async fn add_connections_access(&self, key: &ConnectionKey, subjects: &[String]) -> Result<(), LoadError> {
        self.service
            .add_connections_access(key.project_id(), &[key.connection_id().to_string()], subjects)
            .await
    }

    pub async fn delete_connections_access(&self, key: &ConnectionKey, subjects: &[String]) -> Result<(), LoadError> {
        self.service
            .delete_connections_access(key.project_id(), &[key.connection_id().to_string()], subjects)
            .await
    }

    /// Open the connection on the server. The entry is flagged `connecting`
    /// while the call is in flight.
    pub async fn init(&self, config: &ConnectionInitConfig) -> Result<Connection, LoadError> {
        let key = config.key();
        let includes = self.includes_for(Some(&key));
        self.cache
            .perform_update(&key, async {
                let _connecting = ConnectingGuard::start(&self.cache, &key);
                let connection = self.service.init_connection(config, &includes).await?;
                self.cache.set(connection);
                self.notify_data_outdated(&key);
                Ok(())
            })
            .await?;
        self.current(&key)
    }

    /// Apply `patch` over the connection's current navigator settings (or
    /// the defaults) and save the result.
    pub async fn change_connection_view(
        &self,
        key: &ConnectionKey,
        patch: &NavigatorSettingsPatch,
    ) -> Result<Connection, LoadError> {
        let settings = self
            .cache
            .get(key)
            .and_then(|connection| connection.navigator_settings)
            .unwrap_or_default()
            .apply(patch);
        let includes = self.includes_for(Some(key));
        let connection = self
            .service
            .set_navigator_settings(key, &settings, &includes)
            .await?;
        self.cache.set(connection);
        self.notify_data_outdated(key);
        self.current(key)
    }

    pub async fn update(&self, key: &ConnectionKey, config: &ConnectionConfig) -> Result<Connection, LoadError> {
        let includes = self.includes_for(Some(key));
        self.cache
            .perform_update(key, async {
                let connection = self
                    .service
                    .update_connection(key.project_id(), config, &includes)
                    .await?;
                self.cache.set(connection);
                self.notify_data_outdated(key);
                Ok(())
            })
            .await?;
        self.current(key)
    }

    pub async fn close(&self, key: &ConnectionKey) -> Result<Connection, LoadError> {
        let includes = self.includes_for(Some(key));
        self.cache
            .perform_update(key, async {
                let connection = self.service.close_connection(key, &includes).await?;
                self.cache.set(connection);
                self.notify_data_outdated(key);
                Ok(())
            })
            .await?;
        self.current(key)
    }

    /// Delete every addressed connection on the server and then locally.
    /// Stops at the first failure; connections deleted before it stay
    /// deleted.
    pub async fn delete_connection(&self, key: &ResourceKey<ConnectionKey>) -> Result<(), LoadError> {
        let keys = self.cache.resolve(key);
        for key in &keys {
            self.cache
                .perform_update(key, self.service.delete_connection(key))
                .await?;
            self.cache.delete(&ResourceKey::one(key.clone()));
            self.notify_data_outdated(key);
        }
        Ok(())
    }

    /// Ask the server to re-read the session's connections. When anything
    /// changed every entry is marked outdated.
    pub async fn refresh_session_connections(&self) -> Result<bool, LoadError> {
        let changed = self.service.refresh_session_connections().await?;
        if changed {
            self.cache.mark_all_outdated();
        }
        Ok(changed)
    }

    pub fn clean_new_flags(&self) {
        for key in self.cache.keys() {
            self.cache.modify(&key, |connection| connection.is_new = false);
        }
    }

    /// Drop connections of a driver that disappeared.
    pub fn hide_driver_connections(&self, driver_id: &str) -> Vec<ConnectionKey> {
        let hidden: Vec<ConnectionKey> = self
            .cache
            .values()
            .iter()
            .filter(|connection| connection.driver_id == driver_id)
            .map(Connection::key)
            .collect();
        self.cache.delete(&ResourceKey::list(hidden))
    }

    pub fn on_user_change(&self) {
        self.cache.clear();
    }

    pub fn on_active_projects_changed(&self) {
        self.cache.mark_outdated(&active_projects_key());
    }

    /// The server session was refreshed: everything cached may be stale.
    pub fn session_outdated(&self) {
        self.session_update.store(true, Ordering::SeqCst);
        self.cache.mark_all_outdated();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_node_path() {
        assert_eq!(
            connection_node_path("database://postgres-1/db/public"),
            Some("database://postgres-1")
        );
        assert_eq!(connection_node_path("database://postgres-1"), Some("database://postgres-1"));
        assert_eq!(connection_node_path("resource://scripts"), None);
    }

    #[test]
    fn test_includes_use_variable_names() {
        let set = includes(&[ConnectionInclude::AuthNeeded, ConnectionInclude::Properties]);
        assert_eq!(set.len(), 2);
        assert!(set.contains("includeAuthNeeded"));
        assert!(set.contains("includeProperties"));
    }

    #[test]
    fn test_project_key_carries_ids() {
        let key = project_key(["p1", "p2"]);
        let alias = key.as_alias().unwrap();
        assert_eq!(alias.name(), PROJECTS_ALIAS);
        assert_eq!(alias.params(), ["p1".to_string(), "p2".to_string()]);
        assert_eq!(active_projects_key().as_alias().unwrap().name(), ACTIVE_PROJECTS_ALIAS);
    }

    #[test]
    fn test_node_index_follows_cache_changes() {
        let index = NodePathIndex::default();
        let key = ConnectionKey::new("p1", "c1");
        let connection = Connection {
            id: "c1".to_string(),
            project_id: "p1".to_string(),
            node_path: Some("database://c1".to_string()),
            ..Default::default()
        };

        index.on_set(&key, &connection);
        assert_eq!(index.get("database://c1"), Some(key.clone()));

        index.on_delete(&key, Some(&connection));
        assert_eq!(index.get("database://c1"), None);

        index.on_set(&key, &connection);
        index.on_clear();
        assert_eq!(index.get("database://c1"), None);
    }
}
