//! The module-loading capability consumed by the parser.
//!
//! The core never touches a filesystem. `@load` and `@file` go through a
//! [`ModuleLoader`] injected by the driver: the CLI supplies a filesystem
//! implementation, editors can supply one backed by open buffers, and tests
//! use the in-memory [`MemoryLoader`] below. Resolution must be idempotent,
//! and the returned `key` is the dedup handle: a file already spliced under
//! some key is a no-op on every later `@load` of the same key.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module '{0}' was not found")]
    NotFound(String),

    #[error("failed to load module '{identifier}': {source}")]
    Io {
        identifier: String,
        #[source]
        source: std::io::Error,
    },
}

/// A successfully resolved module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    /// Stable dedup key (e.g. a canonicalized path).
    pub key: String,
    /// Display name registered with the source map.
    pub name: String,
    /// Raw source text.
    pub content: String,
}

/// Abstract module resolution.
///
/// `from` is the display name of the requesting file, so implementations
/// can resolve relative identifiers; it is `None` for the entry file.
pub trait ModuleLoader {
    fn resolve(&mut self, identifier: &str, from: Option<&str>) -> Result<LoadedModule, LoadError>;
}

/// Loader over a fixed name → source map. Used by tests and embedders that
/// already hold sources in memory.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    modules: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> MemoryLoader {
        MemoryLoader::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.modules.insert(name.into(), source.into());
        self
    }
}

impl ModuleLoader for MemoryLoader {
    fn resolve(&mut self, identifier: &str, _from: Option<&str>) -> Result<LoadedModule, LoadError> {
        match self.modules.get(identifier) {
            Some(content) => Ok(LoadedModule {
                key: identifier.to_string(),
                name: identifier.to_string(),
                content: content.clone(),
            }),
            None => Err(LoadError::NotFound(identifier.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_loader_resolves_inserted_modules() {
        let mut loader = MemoryLoader::new();
        loader.insert("main", "x :: 1");
        let module = loader.resolve("main", None).expect("resolve");
        assert_eq!(module.key, "main");
        assert_eq!(module.content, "x :: 1");
    }

    #[test]
    fn memory_loader_reports_missing_modules() {
        let mut loader = MemoryLoader::new();
        let err = loader.resolve("ghost", Some("main")).unwrap_err();
        assert!(matches!(err, LoadError::NotFound(name) if name == "ghost"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let mut loader = MemoryLoader::new();
        loader.insert("util", "helper :: 7");
        let a = loader.resolve("util", None).expect("first");
        let b = loader.resolve("util", None).expect("second");
        assert_eq!(a, b);
    }
}
