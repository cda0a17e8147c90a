//! Session wiring: activation, expiry tracking, and resync after reconnects.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use harbor_connections::{ConnectionInfoResource, GraphQlConnectionService, InvalidationGlue};
use harbor_core::{EventPayload, EventTopic, ProjectsActiveEvent, SessionEvent, TransportError};
use harbor_events::{Activation, EventRouter, SharedFlag, Subscription};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Opens the GraphQL session before the socket may carry client events.
pub struct GraphQlActivation {
    service: Arc<GraphQlConnectionService>,
}

impl GraphQlActivation {
    pub fn new(service: Arc<GraphQlConnectionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Activation for GraphQlActivation {
    async fn activate(&self) -> Result<(), TransportError> {
        self.service
            .open_session()
            .await
            .map_err(|e| TransportError::Activation(e.to_string()))
    }
}

/// Session validity reported by `event`: `Some(true)` when it says the
/// session expired, `Some(false)` when it says the session is valid.
pub fn session_expired(event: &SessionEvent) -> Option<bool> {
    match &event.payload {
        EventPayload::SessionExpired => Some(true),
        EventPayload::SessionState(state) => state.is_valid.map(|valid| !valid),
        _ => None,
    }
}

/// Keep `expiry` in step with the server's session reports. The transport
/// stops reconnecting while it is set.
pub fn track_session(router: &EventRouter, expiry: SharedFlag) -> Subscription {
    router.on_filtered(
        |event| {
            matches!(
                event.payload,
                EventPayload::SessionExpired | EventPayload::SessionState(_)
            )
        },
        |event| session_expired(&event),
        move |expired| {
            if let Some(expired) = expired {
                if expired && !expiry.get() {
                    warn!("Server session expired");
                }
                expiry.set(expired);
            }
        },
    )
}

fn projects_active(projects: Vec<String>) -> SessionEvent {
    SessionEvent::new(
        Some(EventTopic::CbProjects),
        EventPayload::ProjectsActive(ProjectsActiveEvent {
            project_ids: projects,
        }),
    )
}

/// After every socket open, report the active projects. After every open
/// but the first, also treat the session as outdated and reload the
/// active-project connections, since events may have been missed.
pub fn resync_on_reopen(router: &EventRouter, glue: InvalidationGlue) -> Subscription {
    let mut opened = router.transport().on_init();
    let router = router.clone();
    Subscription::for_task(tokio::spawn(async move {
        loop {
            let count = match opened.recv().await {
                Ok(count) => count,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Open notifications lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let resource = glue.resource();
            if let Err(err) = router.emit(projects_active(resource.active_projects().ids())) {
                warn!(error = %err, "Failed to report active projects");
            }
            if count <= 1 {
                continue;
            }

            info!(count, "Session channel reopened, resynchronizing");
            if let Err(err) = glue.resync_session().await {
                warn!(error = %err, "Failed to reload connections");
            }
        }
    }))
}

/// Log every connection notification until the returned subscriptions drop.
pub fn log_notifications(resource: &ConnectionInfoResource) -> Vec<Subscription> {
    let mut created = resource.on_connection_create();
    let mut closed = resource.on_connection_close();
    let mut deleted = resource.on_item_delete();
    let mut outdated = resource.on_data_outdated();

    vec![
        Subscription::for_task(tokio::spawn(async move {
            while let Some(connection) = created.next().await {
                info!(key = %connection.key(), name = %connection.name, "Connection created");
            }
        })),
        Subscription::for_task(tokio::spawn(async move {
            while let Some(key) = closed.next().await {
                info!(key = %key, "Connection closed");
            }
        })),
        Subscription::for_task(tokio::spawn(async move {
            while let Some(key) = deleted.next().await {
                info!(key = %key, "Connection deleted");
            }
        })),
        Subscription::for_task(tokio::spawn(async move {
            while let Some(outdated) = outdated.next().await {
                debug!(?outdated, "Connection data outdated");
            }
        })),
    ]
}
