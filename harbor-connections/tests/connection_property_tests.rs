//! Property-Based Tests for the Connection Cache
//!
//! **Property 1: Include Groups Survive Partial Payloads**
//! A payload without some include groups keeps the groups already cached.
//!
//! **Property 2: Close Detection**
//! A `Closed` notification is published exactly when a cached connection
//! flips from connected to disconnected.
//!
//! **Property 3: Project Alias Resolution**
//! The project alias resolves to exactly the cached keys of its projects.

use std::collections::BTreeSet;
use std::sync::Arc;

use harbor_connections::project_key;
use harbor_core::{Connection, ConnectionKey};
use harbor_storage::ResourceEvent;
use harbor_test_utils::fixtures;
use harbor_test_utils::generators::{arb_connection, arb_connection_key};
use harbor_test_utils::MockConnectionService;
use proptest::prelude::*;

fn empty_resource() -> harbor_connections::ConnectionInfoResource {
    fixtures::resource(Arc::new(MockConnectionService::new()), &[])
}

/// Same connection with every include group dropped.
fn bare(connection: &Connection) -> Connection {
    Connection {
        auth_needed: None,
        credentials_saved: None,
        navigator_settings: None,
        description: None,
        ..connection.clone()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 1: Include Groups Survive Partial Payloads**
    #[test]
    fn prop_partial_payload_keeps_groups(full in arb_connection(), connected in any::<bool>()) {
        let resource = empty_resource();
        resource.cache().set(full.clone());

        let partial = Connection { connected, ..bare(&full) };
        let merged = resource.cache().set(partial);

        let merged = merged.ok_or_else(|| TestCaseError::fail("set rejected a valid key"))?;
        prop_assert_eq!(merged.connected, connected);
        prop_assert_eq!(&merged.auth_needed, &full.auth_needed);
        prop_assert_eq!(&merged.credentials_saved, &full.credentials_saved);
        prop_assert_eq!(&merged.navigator_settings, &full.navigator_settings);
        prop_assert_eq!(&merged.description, &full.description);
        prop_assert_eq!(resource.cache().len(), 1);
    }

    /// **Property 2: Close Detection**
    #[test]
    fn prop_closed_published_on_disconnect_only(
        connection in arb_connection(),
        before in any::<bool>(),
        after in any::<bool>(),
    ) {
        let resource = empty_resource();
        resource.cache().set(Connection { connected: before, ..connection.clone() });
        let mut events = resource.cache().subscribe();

        resource.cache().set(Connection { connected: after, ..connection.clone() });

        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ResourceEvent::Closed(ref key) if *key == connection.key()) {
                closed += 1;
            }
        }
        prop_assert_eq!(closed, usize::from(before && !after));
    }

    /// **Property 3: Project Alias Resolution**
    #[test]
    fn prop_project_alias_matches_cached_keys(
        keys in prop::collection::btree_set(arb_connection_key(), 0..12),
        project in "[a-z][a-z0-9_-]{0,11}",
    ) {
        let resource = empty_resource();
        for key in &keys {
            resource.cache().set(fixtures::connection(key.project_id(), key.connection_id(), "n"));
        }

        let resolved: BTreeSet<ConnectionKey> = resource
            .cache()
            .resolve(&project_key([project.as_str()]))
            .into_iter()
            .collect();
        let expected: BTreeSet<ConnectionKey> = keys
            .iter()
            .filter(|key| key.project_id() == project)
            .cloned()
            .collect();
        prop_assert_eq!(resolved, expected);
    }
}
