//! Harbor client entry point.

use std::sync::Arc;

use harbor_client::config::ClientConfig;
use harbor_client::error::ClientError;
use harbor_client::session::{log_notifications, resync_on_reopen, track_session, GraphQlActivation};
use harbor_client::startup::{
    startup_order, InitialLoad, Invalidation, NotificationLog, ReopenResync, SessionTracking,
};
use harbor_client::telemetry::init_tracing;
use harbor_connections::{
    active_projects_key, ActiveProjects, AutoApprove, ConnectionInfoResource, ConnectionService,
    DataSynchronization, GraphQlConnectionService, InvalidationGlue,
};
use harbor_core::DataAction;
use harbor_events::{
    EventRouter, EventTransport, SessionCollaborators, SharedFlag, TungsteniteConnector,
};
use harbor_storage::{CacheConfig, IncludeSet};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let config = ClientConfig::load()?;
    init_tracing(&config.logging)?;

    let service = Arc::new(GraphQlConnectionService::new(
        config.graphql_endpoint.clone(),
        config.request_timeout(),
    )?);

    let expiry = SharedFlag::new(false);
    let collaborators = SessionCollaborators::new(
        Arc::new(SharedFlag::new(true)),
        Arc::new(expiry.clone()),
        Arc::new(GraphQlActivation::new(Arc::clone(&service))),
    );
    let transport = EventTransport::spawn(
        TungsteniteConnector::new(config.ws_endpoint.clone()),
        collaborators,
        config.transport_config(),
    );
    let router = EventRouter::new(transport);

    let resource = ConnectionInfoResource::new(
        service as Arc<dyn ConnectionService>,
        ActiveProjects::new(config.session.active_projects.iter().cloned()),
        CacheConfig::default(),
    );
    let glue = InvalidationGlue::new(
        resource.clone(),
        Arc::new(AutoApprove) as Arc<dyn DataSynchronization>,
    );

    let mut subscriptions = Vec::new();
    for step in startup_order()? {
        debug!(step, "Startup step");
        match step {
            SessionTracking::NAME => subscriptions.push(track_session(&router, expiry.clone())),
            ReopenResync::NAME => subscriptions.push(resync_on_reopen(&router, glue.clone())),
            Invalidation::NAME => subscriptions.push(glue.attach(&router)),
            NotificationLog::NAME => subscriptions.extend(log_notifications(&resource)),
            InitialLoad::NAME => match resource
                .load(&active_projects_key(), &IncludeSet::empty())
                .await
            {
                Ok(connections) => info!(count = connections.len(), "Connections loaded"),
                Err(err) => warn!(error = %err, "Initial connection load failed"),
            },
            other => warn!(step = other, "Unknown startup step"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    drop(subscriptions);
    if let Err(err) = router.transport().disconnect() {
        warn!(error = %err, "Transport already stopped");
    }
    Ok(())
}
