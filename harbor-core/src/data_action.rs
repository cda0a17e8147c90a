//! Static registry of data-viewer actions and their dependencies.
//!
//! Actions declare their dependencies as associated constants and are
//! registered explicitly at startup, so dependent actions can be discovered
//! without runtime type metadata.

use std::collections::{HashMap, HashSet};

use crate::error::ActionError;

/// A data action that other actions may depend on.
pub trait DataAction {
    /// Unique action name.
    const NAME: &'static str;
    /// Names of the actions this one requires.
    const DEPENDS_ON: &'static [&'static str] = &[];
}

#[derive(Debug, Default, Clone)]
pub struct DataActionRegistry {
    actions: HashMap<&'static str, &'static [&'static str]>,
}

impl DataActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `A`. Registering the same name twice is an error.
    pub fn register<A: DataAction>(&mut self) -> Result<(), ActionError> {
        if self.actions.contains_key(A::NAME) {
            return Err(ActionError::Duplicate(A::NAME));
        }
        self.actions.insert(A::NAME, A::DEPENDS_ON);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Direct dependencies of `name`; empty for unknown actions.
    pub fn depending_actions(&self, name: &str) -> &'static [&'static str] {
        self.actions.get(name).copied().unwrap_or(&[])
    }

    /// All transitive dependencies of `name` followed by `name` itself,
    /// dependencies first.
    pub fn resolve_order(&self, name: &str) -> Result<Vec<&'static str>, ActionError> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut visiting = HashSet::new();
        self.visit(name, &mut visiting, &mut done, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        visiting: &mut HashSet<&'static str>,
        done: &mut HashSet<&'static str>,
        order: &mut Vec<&'static str>,
    ) -> Result<(), ActionError> {
        let (&key, deps) = self
            .actions
            .get_key_value(name)
            .ok_or_else(|| ActionError::Unknown(name.to_string()))?;
        if done.contains(key) {
            return Ok(());
        }
        if !visiting.insert(key) {
            return Err(ActionError::Cycle(key.to_string()));
        }
        for dep in deps.iter() {
            self.visit(dep, visiting, done, order)?;
        }
        visiting.remove(key);
        done.insert(key);
        order.push(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Format;
    impl DataAction for Format {
        const NAME: &'static str = "format";
    }

    struct Edit;
    impl DataAction for Edit {
        const NAME: &'static str = "edit";
        const DEPENDS_ON: &'static [&'static str] = &["format"];
    }

    struct Select;
    impl DataAction for Select {
        const NAME: &'static str = "select";
        const DEPENDS_ON: &'static [&'static str] = &["edit", "format"];
    }

    struct Loop;
    impl DataAction for Loop {
        const NAME: &'static str = "loop";
        const DEPENDS_ON: &'static [&'static str] = &["loop"];
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = DataActionRegistry::new();
        registry.register::<Format>().unwrap();
        assert_eq!(
            registry.register::<Format>(),
            Err(ActionError::Duplicate("format"))
        );
    }

    #[test]
    fn test_resolve_order_puts_dependencies_first() {
        let mut registry = DataActionRegistry::new();
        registry.register::<Select>().unwrap();
        registry.register::<Edit>().unwrap();
        registry.register::<Format>().unwrap();

        assert_eq!(registry.depending_actions("edit"), &["format"]);
        assert_eq!(
            registry.resolve_order("select").unwrap(),
            vec!["format", "edit", "select"]
        );
    }

    #[test]
    fn test_cycle_and_unknown_are_reported() {
        let mut registry = DataActionRegistry::new();
        registry.register::<Loop>().unwrap();
        registry.register::<Edit>().unwrap();
        assert!(matches!(registry.resolve_order("loop"), Err(ActionError::Cycle(_))));
        assert!(matches!(registry.resolve_order("edit"), Err(ActionError::Unknown(_))));
    }
}
