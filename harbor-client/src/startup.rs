//! Startup steps and the order they run in.
//!
//! Each step declares what must be wired before it. The initial connection
//! load depends on everything that reacts to cache changes and push events,
//! so nothing that happens during the load goes unobserved.

use harbor_core::{ActionError, DataAction, DataActionRegistry};

/// Keep the transport's session-expiry flag in step with the server.
pub struct SessionTracking;

impl DataAction for SessionTracking {
    const NAME: &'static str = "session-tracking";
}

/// Report active projects on every open and resync on every reopen.
pub struct ReopenResync;

impl DataAction for ReopenResync {
    const NAME: &'static str = "reopen-resync";
    const DEPENDS_ON: &'static [&'static str] = &[SessionTracking::NAME];
}

/// Apply datasource and session push events to the cache.
pub struct Invalidation;

impl DataAction for Invalidation {
    const NAME: &'static str = "invalidation";
    const DEPENDS_ON: &'static [&'static str] = &[SessionTracking::NAME];
}

pub struct NotificationLog;

impl DataAction for NotificationLog {
    const NAME: &'static str = "notification-log";
}

/// Load the active projects' connections.
pub struct InitialLoad;

impl DataAction for InitialLoad {
    const NAME: &'static str = "initial-load";
    const DEPENDS_ON: &'static [&'static str] = &[
        Invalidation::NAME,
        ReopenResync::NAME,
        NotificationLog::NAME,
    ];
}

pub fn startup_registry() -> Result<DataActionRegistry, ActionError> {
    let mut registry = DataActionRegistry::new();
    registry.register::<SessionTracking>()?;
    registry.register::<ReopenResync>()?;
    registry.register::<Invalidation>()?;
    registry.register::<NotificationLog>()?;
    registry.register::<InitialLoad>()?;
    Ok(registry)
}

/// Every startup step, dependencies first, ending with [`InitialLoad`].
pub fn startup_order() -> Result<Vec<&'static str>, ActionError> {
    startup_registry()?.resolve_order(InitialLoad::NAME)
}
