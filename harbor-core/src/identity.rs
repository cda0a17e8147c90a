//! Composite keys addressing cached connection entries.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::KeyError;

/// Project identifier as issued by the server.
pub type ProjectId = String;

/// Connection identifier, unique within a project.
pub type ConnectionId = String;

/// Separator used by [`ConnectionKey::serialize`].
const KEY_SEPARATOR: char = ':';

/// Composite key of one connection: project id plus connection id.
///
/// Equality and hashing are structural. Fields are private so a key
/// cannot change after it was used to address an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionKey {
    project_id: ProjectId,
    connection_id: ConnectionId,
}

impl ConnectionKey {
    pub fn new(project_id: impl Into<ProjectId>, connection_id: impl Into<ConnectionId>) -> Self {
        Self {
            project_id: project_id.into(),
            connection_id: connection_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Serialize to the `project:connection` form.
    pub fn serialize(&self) -> String {
        format!("{}{}{}", self.project_id, KEY_SEPARATOR, self.connection_id)
    }

    /// Parse the `project:connection` form. The project part must not contain
    /// the separator; the connection part may.
    pub fn parse(value: &str) -> Result<Self, KeyError> {
        let (project_id, connection_id) =
            value
                .split_once(KEY_SEPARATOR)
                .ok_or_else(|| KeyError::Malformed {
                    key: value.to_string(),
                    reason: "missing ':' separator".to_string(),
                })?;
        let key = Self::new(project_id, connection_id);
        key.validate()?;
        Ok(key)
    }

    /// Check that both parts are present.
    pub fn validate(&self) -> Result<(), KeyError> {
        if self.project_id.trim().is_empty() {
            return Err(self.malformed("projectId must not be empty"));
        }
        if self.connection_id.trim().is_empty() {
            return Err(self.malformed("connectionId must not be empty"));
        }
        if self.project_id.contains(KEY_SEPARATOR) {
            return Err(self.malformed("projectId must not contain ':'"));
        }
        Ok(())
    }

    fn malformed(&self, reason: &str) -> KeyError {
        KeyError::Malformed {
            key: format!("{:?}", self),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

/// Build the keys of a project-scoped datasource id list.
pub fn keys_for_project(project_id: &str, connection_ids: &[ConnectionId]) -> Vec<ConnectionKey> {
    connection_ids
        .iter()
        .map(|connection_id| ConnectionKey::new(project_id, connection_id.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_roundtrip() {
        let key = ConnectionKey::new("g_GlobalConfiguration", "postgres-jdbc-1");
        assert_eq!(ConnectionKey::parse(&key.serialize()).unwrap(), key);
    }

    #[test]
    fn test_connection_part_may_contain_separator() {
        let key = ConnectionKey::parse("p1:conn:with:colons").unwrap();
        assert_eq!(key.project_id(), "p1");
        assert_eq!(key.connection_id(), "conn:with:colons");
    }

    #[test]
    fn test_validate_rejects_empty_parts() {
        assert!(ConnectionKey::new("", "c1").validate().is_err());
        assert!(ConnectionKey::new("p1", " ").validate().is_err());
        assert!(ConnectionKey::parse("no-separator").is_err());
    }

    #[test]
    fn test_keys_for_project() {
        let keys = keys_for_project("p1", &["a".to_string(), "b".to_string()]);
        assert_eq!(keys, vec![ConnectionKey::new("p1", "a"), ConnectionKey::new("p1", "b")]);
    }

    #[test]
    fn test_serde_uses_camel_case() {
        let json = serde_json::to_value(ConnectionKey::new("p1", "c1")).unwrap();
        assert_eq!(json["projectId"], "p1");
        assert_eq!(json["connectionId"], "c1");
    }

    proptest! {
        #[test]
        fn equal_fields_mean_equal_keys(project in "[a-z0-9_]{1,12}", connection in "[a-z0-9_-]{1,12}") {
            let a = ConnectionKey::new(project.clone(), connection.clone());
            let b = ConnectionKey::new(project, connection);
            prop_assert_eq!(&a, &b);
            let mut set = HashSet::new();
            set.insert(a);
            prop_assert!(set.contains(&b));
        }
    }
}
