//! Action registry: resolves step configurations to step instances.

use crate::action::Action;
use indexmap::IndexMap;
use std::sync::Arc;
use tributary_core::{ActionConf, CoreError, CoreResult};

/// Builds a fresh step instance from its configuration
pub type ActionFactory = Arc<dyn Fn(&ActionConf) -> CoreResult<Box<dyn Action>> + Send + Sync>;

/// Error from registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Name already registered
    AlreadyRegistered {
        /// Action name
        name: String,
    },
    /// Name not registered
    NotFound {
        /// Action name
        name: String,
    },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRegistered { name } => write!(f, "Action already registered: {}", name),
            Self::NotFound { name } => write!(f, "Action not registered: {}", name),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRegistered { name } => CoreError::AlreadyExists {
                kind: "Action".to_string(),
                id: name,
            },
            RegistryError::NotFound { .. } => CoreError::usage("action", err.to_string()),
        }
    }
}

/// Registry of step factories by name
#[derive(Clone, Default)]
pub struct ActionRegistry {
    factories: IndexMap<String, ActionFactory>,
}

impl ActionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in steps
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a factory
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&ActionConf) -> CoreResult<Box<dyn Action>> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered {
                name: name.to_string(),
            });
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Register a factory, replacing any previous one
    pub fn register_or_replace<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ActionConf) -> CoreResult<Box<dyn Action>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Instantiate a step
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown or the factory rejects the
    /// parameters
    pub fn create(&self, conf: &ActionConf) -> CoreResult<Box<dyn Action>> {
        let factory = self
            .factories
            .get(&conf.name)
            .ok_or_else(|| RegistryError::NotFound {
                name: conf.name.clone(),
            })?;
        factory(conf)
    }

    /// Whether a name is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
