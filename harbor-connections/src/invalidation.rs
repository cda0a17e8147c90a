//! Datasource and session push events to connection cache invalidation.
//!
//! The behavior per event is data, not code: [`CONNECTION_INVALIDATION`]
//! maps each server event id to an [`InvalidationAction`], and
//! [`InvalidationGlue`] interprets the table.

use std::sync::Arc;

use harbor_core::{
    ConnectionKey, EventId, EventTopic, HarborError, HarborResult, ServerEventId, SessionEvent,
    SyncError,
};
use harbor_events::{EventRouter, Subscription};
use harbor_storage::{IncludeSet, ResourceKey};
use tracing::{debug, trace, warn};

use crate::resource::{active_projects_key, ConnectionInfoResource};
use crate::sync::DataSynchronization;

/// Entity kind passed to [`DataSynchronization`].
const SYNC_KIND: &str = "connection";

/// Local change applied to the affected entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationEffect {
    /// Flag stale; the value stays readable until reloaded.
    Outdate,
    /// Remove from the cache. Nothing is sent to the server.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationAction {
    /// Load the affected connections and announce each as created.
    Reload,
    /// If every affected connection is open, ask for synchronization first
    /// and do nothing when it is declined.
    SynchronizeIfConnected(InvalidationEffect),
    /// Apply only when the connected state equals `connected` and no
    /// connect is in flight.
    WhenIdle {
        connected: bool,
        then: InvalidationEffect,
    },
    /// The server session was rebound: mark everything outdated and reload
    /// the active projects. Deletions found by the reload are silent.
    ResyncSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationRule {
    pub id: ServerEventId,
    pub action: InvalidationAction,
}

pub const CONNECTION_INVALIDATION: &[InvalidationRule] = &[
    InvalidationRule {
        id: ServerEventId::CbDatasourceCreated,
        action: InvalidationAction::Reload,
    },
    InvalidationRule {
        id: ServerEventId::CbDatasourceUpdated,
        action: InvalidationAction::SynchronizeIfConnected(InvalidationEffect::Outdate),
    },
    InvalidationRule {
        id: ServerEventId::CbDatasourceDeleted,
        action: InvalidationAction::SynchronizeIfConnected(InvalidationEffect::Delete),
    },
    InvalidationRule {
        id: ServerEventId::CbDatasourceConnected,
        action: InvalidationAction::WhenIdle {
            connected: false,
            then: InvalidationEffect::Outdate,
        },
    },
    InvalidationRule {
        id: ServerEventId::CbDatasourceDisconnected,
        action: InvalidationAction::WhenIdle {
            connected: true,
            then: InvalidationEffect::Outdate,
        },
    },
    InvalidationRule {
        id: ServerEventId::CbSessionWebsocketConnected,
        action: InvalidationAction::ResyncSession,
    },
];

/// Topics the invalidating events arrive on.
const INVALIDATION_TOPICS: [EventTopic; 3] = [
    EventTopic::CbDatasource,
    EventTopic::CbDatasourceConnection,
    EventTopic::CbSession,
];

/// Applies invalidation rules to a [`ConnectionInfoResource`].
#[derive(Clone)]
pub struct InvalidationGlue {
    resource: ConnectionInfoResource,
    sync: Arc<dyn DataSynchronization>,
    rules: &'static [InvalidationRule],
}

impl InvalidationGlue {
    pub fn new(resource: ConnectionInfoResource, sync: Arc<dyn DataSynchronization>) -> Self {
        Self {
            resource,
            sync,
            rules: CONNECTION_INVALIDATION,
        }
    }

    pub fn with_rules(mut self, rules: &'static [InvalidationRule]) -> Self {
        self.rules = rules;
        self
    }

    pub fn resource(&self) -> &ConnectionInfoResource {
        &self.resource
    }

    pub fn rule_for(&self, id: EventId) -> Option<&'static InvalidationRule> {
        self.rules.iter().find(|rule| EventId::from(rule.id) == id)
    }

    /// Subscribe to the invalidation topics and apply every matching event,
    /// one at a time in arrival order.
    pub fn attach(&self, router: &EventRouter) -> Subscription {
        let glue = self.clone();
        let rules = self.rules;
        let mut events = router.subscribe_topic_events(&INVALIDATION_TOPICS, move |event| {
            let id = event.id();
            rules.iter().any(|rule| EventId::from(rule.id) == id)
        });
        Subscription::for_task(tokio::spawn(async move {
            while let Some(event) = events.next_event().await {
                match glue.handle(&event).await {
                    Ok(()) => {}
                    Err(HarborError::Sync(err)) => debug!(event = %event.id(), error = %err, "Event not applied"),
                    Err(err) => warn!(event = %event.id(), error = %err, "Failed to apply event"),
                }
            }
        }))
    }

    /// Apply the rule for `event`, if any.
    pub async fn handle(&self, event: &SessionEvent) -> HarborResult<()> {
        let id = event.id();
        let Some(rule) = self.rule_for(id) else {
            trace!(event = %id, "No invalidation rule");
            return Ok(());
        };
        if rule.action == InvalidationAction::ResyncSession {
            return self.resync_session().await;
        }
        let keys = event.connection_keys();
        if keys.is_empty() {
            return Ok(());
        }
        let key = ResourceKey::list(keys);

        match rule.action {
            InvalidationAction::Reload => {
                let connections = self.resource.load(&key, &IncludeSet::empty()).await?;
                for connection in connections {
                    self.resource.notify_created(connection);
                }
            }
            InvalidationAction::SynchronizeIfConnected(effect) => {
                if self.resource.is_connected(&key) {
                    let names: Vec<String> = self
                        .resource
                        .cache()
                        .get_many(&key)
                        .into_iter()
                        .map(|connection| connection.name)
                        .collect();
                    let proceed = self
                        .sync
                        .request_synchronization(SYNC_KIND, &names.join("\n"))
                        .await;
                    if !proceed {
                        return Err(SyncError::Declined {
                            kind: SYNC_KIND.to_string(),
                        }
                        .into());
                    }
                }
                self.apply(effect, &key);
            }
            InvalidationAction::WhenIdle { connected, then } => {
                if self.resource.is_connected(&key) == connected && !self.resource.is_connecting(&key) {
                    self.apply(then, &key);
                }
            }
            InvalidationAction::ResyncSession => {}
        }
        Ok(())
    }

    /// The server session was refreshed.
    pub fn session_outdated(&self) {
        self.resource.session_outdated();
    }

    /// Mark the session outdated and reload the active projects. The
    /// session-update flag clears once the reload is applied.
    pub async fn resync_session(&self) -> HarborResult<()> {
        debug!("Resynchronizing connections with the server session");
        self.session_outdated();
        let connections = self
            .resource
            .load(&active_projects_key(), &IncludeSet::empty())
            .await?;
        debug!(count = connections.len(), "Connections resynchronized");
        Ok(())
    }

    fn apply(&self, effect: InvalidationEffect, key: &ResourceKey<ConnectionKey>) {
        match effect {
            InvalidationEffect::Outdate => self.resource.cache().mark_outdated(key),
            InvalidationEffect::Delete => {
                self.resource.cache().delete(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_datasource_event_has_one_rule() {
        let ids = [
            ServerEventId::CbDatasourceCreated,
            ServerEventId::CbDatasourceUpdated,
            ServerEventId::CbDatasourceDeleted,
            ServerEventId::CbDatasourceConnected,
            ServerEventId::CbDatasourceDisconnected,
        ];
        for id in ids {
            let count = CONNECTION_INVALIDATION.iter().filter(|rule| rule.id == id).count();
            assert_eq!(count, 1, "{}", id.as_str());
        }
    }

    #[test]
    fn test_deletion_asks_before_dropping_open_connections() {
        let rule = CONNECTION_INVALIDATION
            .iter()
            .find(|rule| rule.id == ServerEventId::CbDatasourceDeleted)
            .unwrap();
        assert_eq!(
            rule.action,
            InvalidationAction::SynchronizeIfConnected(InvalidationEffect::Delete)
        );
    }

    #[test]
    fn test_session_rebind_resyncs() {
        let rule = CONNECTION_INVALIDATION
            .iter()
            .find(|rule| rule.id == ServerEventId::CbSessionWebsocketConnected)
            .unwrap();
        assert_eq!(rule.action, InvalidationAction::ResyncSession);
        assert!(INVALIDATION_TOPICS.contains(&EventTopic::CbSession));
    }

    #[test]
    fn test_state_events_skip_connections_in_that_state() {
        let connected = CONNECTION_INVALIDATION
            .iter()
            .find(|rule| rule.id == ServerEventId::CbDatasourceConnected)
            .unwrap();
        assert_eq!(
            connected.action,
            InvalidationAction::WhenIdle {
                connected: false,
                then: InvalidationEffect::Outdate
            }
        );
    }
}
