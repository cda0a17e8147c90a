//! Push events applied to the connection cache.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use harbor_connections::{DataSynchronization, InvalidationGlue};
use harbor_core::{ConnectionKey, EventTopic, HarborError, LoadError, SessionEvent, SyncError};
use harbor_events::EventRouter;
use harbor_storage::{IncludeSet, ResourceKey};
use harbor_test_utils::fixtures::{self, connected_connection, connection};
use harbor_test_utils::{settle, MockConnectionService, MockSynchronization, ScriptedConnector};

fn key(id: &str) -> ConnectionKey {
    ConnectionKey::new("p1", id)
}

struct Setup {
    service: Arc<MockConnectionService>,
    sync: Arc<MockSynchronization>,
    glue: InvalidationGlue,
}

/// Glue over a loaded cache holding `c1` (connected), `c2` (connected)
/// and `c3` (closed).
async fn setup(proceed: bool) -> Setup {
    let service = Arc::new(MockConnectionService::with_connections([
        connected_connection("p1", "c1", "Orders"),
        connected_connection("p1", "c2", "Billing"),
        connection("p1", "c3", "Archive"),
    ]));
    let sync = Arc::new(MockSynchronization::new(proceed));
    let resource = fixtures::resource(Arc::clone(&service), &["p1"]);
    resource
        .load(&ResourceKey::all(), &IncludeSet::empty())
        .await
        .unwrap();
    let glue = InvalidationGlue::new(resource, Arc::clone(&sync) as Arc<dyn DataSynchronization>);
    Setup { service, sync, glue }
}

fn outdated(glue: &InvalidationGlue, id: &str) -> bool {
    glue.resource().cache().is_outdated(&ResourceKey::one(key(id)))
}

// ============================================================================
// DELETED
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_delete_of_open_connection_asks_once_then_removes() {
    let s = setup(true).await;
    let mut deleted = s.glue.resource().on_item_delete();

    s.glue
        .handle(&SessionEvent::datasource_deleted("p1", &["c1"]))
        .await
        .unwrap();

    assert_eq!(s.sync.requests(), vec![("connection".to_string(), "Orders".to_string())]);
    assert!(s.glue.resource().get(&key("c1")).is_none());
    assert_eq!(deleted.next().await, Some(key("c1")));
    assert_eq!(s.service.call_count("delete_connection"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_declined_delete_leaves_connection() {
    let s = setup(false).await;
    let mut deleted = s.glue.resource().on_item_delete();

    let err = s
        .glue
        .handle(&SessionEvent::datasource_deleted("p1", &["c1"]))
        .await
        .unwrap_err();

    assert!(matches!(err, HarborError::Sync(SyncError::Declined { .. })));
    assert_eq!(s.sync.request_count(), 1);
    assert!(s.glue.resource().get(&key("c1")).is_some());
    assert!(tokio::time::timeout(Duration::from_millis(50), deleted.next())
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn test_delete_of_closed_connection_skips_synchronization() {
    let s = setup(false).await;

    s.glue
        .handle(&SessionEvent::datasource_deleted("p1", &["c3"]))
        .await
        .unwrap();

    assert_eq!(s.sync.request_count(), 0);
    assert!(s.glue.resource().get(&key("c3")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_batch_synchronization_lists_every_name() {
    let s = setup(true).await;

    s.glue
        .handle(&SessionEvent::datasource_deleted("p1", &["c1", "c2"]))
        .await
        .unwrap();

    assert_eq!(s.sync.requests()[0].1, "Orders\nBilling");
    assert!(s.glue.resource().cache().get_many(&ResourceKey::list([key("c1"), key("c2")])).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_session_update_is_silent() {
    let s = setup(true).await;
    let mut deleted = s.glue.resource().on_item_delete();

    s.glue.session_outdated();
    s.glue
        .handle(&SessionEvent::datasource_deleted("p1", &["c3"]))
        .await
        .unwrap();

    assert!(s.glue.resource().get(&key("c3")).is_none());
    assert!(tokio::time::timeout(Duration::from_millis(50), deleted.next())
        .await
        .is_err());
}

// ============================================================================
// UPDATED / CREATED
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_update_of_open_connection_outdates_when_approved() {
    let s = setup(true).await;

    s.glue
        .handle(&SessionEvent::datasource_updated("p1", &["c1"]))
        .await
        .unwrap();

    assert_eq!(s.sync.request_count(), 1);
    assert!(outdated(&s.glue, "c1"));
    assert!(s.glue.resource().get(&key("c1")).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_declined_update_keeps_entry_fresh() {
    let s = setup(false).await;

    let result = s
        .glue
        .handle(&SessionEvent::datasource_updated("p1", &["c2"]))
        .await;

    assert!(result.is_err());
    assert!(!outdated(&s.glue, "c2"));
}

#[tokio::test(start_paused = true)]
async fn test_created_event_loads_and_announces() {
    let s = setup(true).await;
    s.service.insert(connection("p1", "c9", "Fresh"));
    let mut created = s.glue.resource().on_connection_create();

    s.glue
        .handle(&SessionEvent::datasource_created("p1", &["c9"]))
        .await
        .unwrap();

    assert_eq!(s.glue.resource().get(&key("c9")).unwrap().name, "Fresh");
    assert_eq!(created.next().await.map(|c| c.key()), Some(key("c9")));
    assert_eq!(s.sync.request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_created_event_for_unknown_connection_fails() {
    let s = setup(true).await;

    let err = s
        .glue
        .handle(&SessionEvent::datasource_created("p1", &["missing"]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarborError::Load(LoadError::NotFound(ref message)) if message == "Connection is not found (missing)"
    ));
}

// ============================================================================
// CONNECTED / DISCONNECTED
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_connected_event_outdates_only_closed_idle_entries() {
    let s = setup(true).await;

    s.glue
        .handle(&SessionEvent::datasource_connected("p1", "c1"))
        .await
        .unwrap();
    assert!(!outdated(&s.glue, "c1"));

    s.glue
        .handle(&SessionEvent::datasource_connected("p1", "c3"))
        .await
        .unwrap();
    assert!(outdated(&s.glue, "c3"));
}

#[tokio::test(start_paused = true)]
async fn test_connected_event_ignored_while_connecting() {
    let s = setup(true).await;
    s.glue
        .resource()
        .cache()
        .update_metadata(&key("c3"), |meta| meta.ext.connecting = true);

    s.glue
        .handle(&SessionEvent::datasource_connected("p1", "c3"))
        .await
        .unwrap();

    assert!(!outdated(&s.glue, "c3"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_event_outdates_open_entries() {
    let s = setup(true).await;

    s.glue
        .handle(&SessionEvent::datasource_disconnected("p1", "c3"))
        .await
        .unwrap();
    assert!(!outdated(&s.glue, "c3"));

    s.glue
        .handle(&SessionEvent::datasource_disconnected("p1", "c2"))
        .await
        .unwrap();
    assert!(outdated(&s.glue, "c2"));
    assert_eq!(s.sync.request_count(), 0);
}

// ============================================================================
// SESSION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_session_rebind_reloads_without_announcing_deletions() {
    let s = setup(true).await;
    let resource = s.glue.resource().clone();
    let mut deleted = resource.on_item_delete();
    s.service.remove(&key("c3"));

    s.glue.handle(&SessionEvent::websocket_connected()).await.unwrap();

    assert!(resource.get(&key("c3")).is_none());
    assert!(!outdated(&s.glue, "c1"));
    assert!(!resource.is_session_update());
    assert_eq!(s.service.call_count("get_user_connections"), 2);
    assert_eq!(s.sync.request_count(), 0);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), deleted.next())
            .await
            .is_err()
    );
}

// ============================================================================
// ROUTER ATTACHMENT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_attached_glue_applies_pushed_events() {
    let s = setup(true).await;
    let connector = ScriptedConnector::new();
    let router = EventRouter::new(fixtures::transport(&connector));
    settle().await;
    connector.open(0);
    settle().await;

    let subscription = s.glue.attach(&router);
    settle().await;
    let subscribed: Vec<_> = connector
        .written_events(0)
        .into_iter()
        .filter_map(|event| event.topic_id)
        .collect();
    assert!(subscribed.contains(&EventTopic::CbDatasource));
    assert!(subscribed.contains(&EventTopic::CbDatasourceConnection));
    assert!(subscribed.contains(&EventTopic::CbSession));

    connector.push(0, &SessionEvent::datasource_disconnected("p1", "c2"));
    connector.push(0, &SessionEvent::datasource_deleted("p1", &["c3"]));
    settle().await;

    assert!(outdated(&s.glue, "c2"));
    assert!(s.glue.resource().get(&key("c3")).is_none());

    s.service.remove(&key("c1"));
    connector.push(0, &SessionEvent::websocket_connected());
    settle().await;
    settle().await;
    assert!(s.glue.resource().get(&key("c1")).is_none());
    assert!(!s.glue.resource().is_session_update());

    subscription.unsubscribe();
    settle().await;
    connector.push(0, &SessionEvent::datasource_deleted("p1", &["c2"]));
    settle().await;
    assert!(s.glue.resource().get(&key("c2")).is_some());
}
