//! Dialplan routing lookups

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Answers whether a dialable extension exists within a context.
#[cfg_attr(test, mockall::automock)]
pub trait DialplanResolver: Send + Sync {
    fn extension_exists(&self, context: &str, extension: &str) -> bool;
}

/// In-memory dialplan backed by a context -> extensions map
#[derive(Default)]
pub struct StaticDialplan {
    contexts: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticDialplan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_extension(&self, context: &str, extension: &str) {
        self.contexts
            .write()
            .unwrap()
            .entry(context.to_string())
            .or_default()
            .insert(extension.to_string());
    }
}

impl DialplanResolver for StaticDialplan {
    fn extension_exists(&self, context: &str, extension: &str) -> bool {
        self.contexts
            .read()
            .unwrap()
            .get(context)
            .map(|extensions| extensions.contains(extension))
            .unwrap_or(false)
    }
}
