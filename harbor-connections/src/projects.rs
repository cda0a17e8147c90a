//! Active project selection.

use std::sync::{Arc, PoisonError, RwLock};

use harbor_core::ProjectId;

/// Projects the user currently works with. Shared between the loader, the
/// alias resolver, and whoever changes the selection.
#[derive(Debug, Clone, Default)]
pub struct ActiveProjects(Arc<RwLock<Vec<ProjectId>>>);

impl ActiveProjects {
    pub fn new<I, S>(projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ProjectId>,
    {
        Self(Arc::new(RwLock::new(projects.into_iter().map(Into::into).collect())))
    }

    pub fn ids(&self) -> Vec<ProjectId> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn contains(&self, project_id: &str) -> bool {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|id| id == project_id)
    }

    pub fn set<I, S>(&self, projects: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<ProjectId>,
    {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) =
            projects.into_iter().map(Into::into).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_selection() {
        let projects = ActiveProjects::new(["p1"]);
        let shared = projects.clone();
        shared.set(["p2", "p3"]);
        assert!(!projects.contains("p1"));
        assert_eq!(projects.ids(), vec!["p2".to_string(), "p3".to_string()]);
    }
}
