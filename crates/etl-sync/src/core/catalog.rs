//! Dialect registry for explicit dependency injection.
//!
//! The [`DialectRegistry`] maps engine families to their SQL generators. It is
//! built once by the composition root and handed to the
//! [`DialectResolver`](crate::dialect::DialectResolver); there is no global
//! state and no runtime discovery.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dialect::{DialectImpl, DialectKind};
use crate::error::{Result, SyncError};

use super::traits::Dialect;

/// Registry of SQL dialects keyed by engine family.
///
/// # Example
///
/// ```rust,ignore
/// let registry = DialectRegistry::with_builtins();
/// let resolver = DialectResolver::new(Arc::new(registry));
/// let dialect = resolver.resolve(datasource.info())?;
/// ```
#[derive(Default)]
pub struct DialectRegistry {
    dialects: HashMap<DialectKind, Arc<dyn Dialect>>,
}

impl DialectRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in dialect registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in DialectKind::ALL {
            registry.register(kind, DialectImpl::from_kind(kind));
        }
        registry
    }

    /// Register (or replace) the dialect for `kind`.
    pub fn register(&mut self, kind: DialectKind, dialect: impl Dialect + 'static) {
        self.dialects.insert(kind, Arc::new(dialect));
    }

    /// Register a shared dialect.
    pub fn register_arc(&mut self, kind: DialectKind, dialect: Arc<dyn Dialect>) {
        self.dialects.insert(kind, dialect);
    }

    /// Get a dialect by kind.
    pub fn get(&self, kind: DialectKind) -> Option<Arc<dyn Dialect>> {
        self.dialects.get(&kind).cloned()
    }

    /// Get a dialect by kind, failing with `UnsupportedDialect` if absent.
    pub fn require(&self, kind: DialectKind) -> Result<Arc<dyn Dialect>> {
        self.get(kind)
            .ok_or_else(|| SyncError::UnsupportedDialect(kind.to_string()))
    }

    /// Registered kinds, sorted for stable output.
    pub fn kinds(&self) -> Vec<DialectKind> {
        let mut kinds: Vec<_> = self.dialects.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
