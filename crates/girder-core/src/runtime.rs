//! Process-wide runtime services
//!
//! The default handler registry lives here behind a small service locator
//! with an explicit lifecycle: `init` at startup, `shutdown` on teardown.
//! Tests should construct their own `HandlerRegistry` and pass it down
//! rather than touching the global.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::registry::HandlerRegistry;

static GLOBAL_REGISTRY: Lazy<RwLock<Option<Arc<HandlerRegistry>>>> =
    Lazy::new(|| RwLock::new(None));

/// Install a fresh global registry, returning it.
///
/// Calling `init` twice replaces the previous instance.
pub fn init() -> Arc<HandlerRegistry> {
    let registry = Arc::new(HandlerRegistry::new());
    *GLOBAL_REGISTRY.write() = Some(registry.clone());
    registry
}

/// The global registry, initializing it on first use
pub fn global_registry() -> Arc<HandlerRegistry> {
    if let Some(registry) = GLOBAL_REGISTRY.read().as_ref() {
        return registry.clone();
    }
    init()
}

/// Drop the global registry
pub fn shutdown() {
    *GLOBAL_REGISTRY.write() = None;
}
