//! Resource handler registry
//!
//! Process-wide tables mapping URL schemes to handler factories and
//! aliases to live handler instances, plus the shutdown lifecycle. The
//! registry is handed to the processor explicitly instead of living in a
//! global, so tests can build and drop isolated registries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{EsiError, Result};
use crate::resource::{scheme_or_alias, ResourceHandler, ResourceOptions};

/// Creates a handler from options. Factories are registered per scheme at
/// startup and invoked when configuration binds a URL or when a tag names
/// a factory-backed scheme directly.
pub type HandlerFactory =
    Box<dyn Fn(&ResourceOptions) -> Result<Arc<dyn ResourceHandler>> + Send + Sync>;

#[derive(Default)]
struct Tables {
    scheme_factories: HashMap<String, HandlerFactory>,
    alias_handlers: HashMap<String, Arc<dyn ResourceHandler>>,
    all_handlers: Vec<Arc<dyn ResourceHandler>>,
}

/// Scheme→factory and alias→handler tables behind one readers-writer lock.
/// Lookups (the hot path) take the read side.
#[derive(Default)]
pub struct ResourceRegistry {
    tables: RwLock<Tables>,
}

impl ResourceRegistry {
    /// An empty registry with no factories. Most callers want
    /// [`crate::backend::default_registry`] instead.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a URL scheme. The scheme is case-folded.
    pub fn register_scheme_factory(&self, scheme: &str, factory: HandlerFactory) {
        let mut tables = self.tables.write().expect("registry lock poisoned");
        tables
            .scheme_factories
            .insert(scheme.to_ascii_lowercase(), factory);
    }

    /// Whether a factory exists for the scheme.
    pub fn supports_scheme(&self, scheme: &str) -> bool {
        let tables = self.tables.read().expect("registry lock poisoned");
        tables
            .scheme_factories
            .contains_key(&scheme.to_ascii_lowercase())
    }

    /// Create a handler for the options: by the URL's scheme factory, or,
    /// for a scheme-less URL, by alias. Anything else is `NotSupported`.
    ///
    /// The new handler is tracked for [`ResourceRegistry::close_all`] but
    /// not yet bound to an alias; callers pair this with
    /// [`ResourceRegistry::register_handler`].
    pub fn new_handler(&self, opts: &ResourceOptions) -> Result<Arc<dyn ResourceHandler>> {
        let key = scheme_or_alias(&opts.url);
        let has_scheme = opts.url.contains("://");

        let mut tables = self.tables.write().expect("registry lock poisoned");
        if has_scheme {
            if let Some(factory) = tables.scheme_factories.get(&key) {
                let handler = factory(opts)?;
                tables.all_handlers.push(handler.clone());
                return Ok(handler);
            }
            return Err(EsiError::NotSupported(format!(
                "no factory for scheme {:?} (URL {:?})",
                key, opts.url
            )));
        }
        if let Some(handler) = tables.alias_handlers.get(&key.to_ascii_lowercase()) {
            return Ok(handler.clone());
        }
        Err(EsiError::NotSupported(format!(
            "no handler registered for alias {:?}",
            key
        )))
    }

    /// Bind a handler instance to an alias. The alias is case-folded so a
    /// tag can reference it as a URL scheme (`myAlias://...`). Rebinding an
    /// alias replaces the previous binding.
    pub fn register_handler(&self, alias: &str, handler: Arc<dyn ResourceHandler>) {
        let mut tables = self.tables.write().expect("registry lock poisoned");
        tables
            .alias_handlers
            .insert(alias.to_ascii_lowercase(), handler.clone());
        tables.all_handlers.push(handler);
    }

    /// Look up a handler by alias.
    pub fn lookup_by_alias(&self, alias: &str) -> Option<Arc<dyn ResourceHandler>> {
        let tables = self.tables.read().expect("registry lock poisoned");
        tables
            .alias_handlers
            .get(&alias.to_ascii_lowercase())
            .cloned()
    }

    /// Remove an alias binding. The handler stays alive until `close_all`
    /// if other resources still reference it.
    pub fn deregister_alias(&self, alias: &str) {
        let mut tables = self.tables.write().expect("registry lock poisoned");
        tables.alias_handlers.remove(&alias.to_ascii_lowercase());
    }

    /// Resolve the handler for a tag's `src` value at parse time.
    ///
    /// A URL with a scheme resolves first against alias bindings keyed by
    /// that scheme, then against scheme factories (creating one shared
    /// handler per distinct URL, idempotently). A scheme-less value
    /// resolves only via the alias table. Everything else is
    /// `NotSupported`, which aborts the parse.
    pub fn resolve_resource(&self, url: &str) -> Result<Arc<dyn ResourceHandler>> {
        let key = scheme_or_alias(url);
        let has_scheme = url.contains("://");

        {
            let tables = self.tables.read().expect("registry lock poisoned");
            if let Some(handler) = tables.alias_handlers.get(&key.to_ascii_lowercase()) {
                return Ok(handler.clone());
            }
            if !has_scheme {
                return Err(EsiError::NotSupported(format!(
                    "unknown resource alias {:?}",
                    url
                )));
            }
            if let Some(handler) = tables.alias_handlers.get(url) {
                return Ok(handler.clone());
            }
        }

        let mut tables = self.tables.write().expect("registry lock poisoned");
        // Another parse may have created the handler between the locks.
        if let Some(handler) = tables.alias_handlers.get(url) {
            return Ok(handler.clone());
        }
        let Some(factory) = tables.scheme_factories.get(&key) else {
            return Err(EsiError::NotSupported(format!(
                "unknown scheme {:?} in resource URL {:?}",
                key, url
            )));
        };
        let opts = ResourceOptions::new(url, url);
        let handler = factory(&opts)?;
        debug!(scheme = %key, url = %url, "created handler from scheme factory");
        tables.alias_handlers.insert(url.to_owned(), handler.clone());
        tables.all_handlers.push(handler.clone());
        Ok(handler)
    }

    /// Close every handler ever created or registered. Reports the first
    /// error but keeps closing. Idempotent: a second call finds nothing
    /// left to close.
    pub async fn close_all(&self) -> Result<()> {
        let handlers = {
            let mut tables = self.tables.write().expect("registry lock poisoned");
            tables.alias_handlers.clear();
            std::mem::take(&mut tables.all_handlers)
        };

        let mut first_err = None;
        for handler in handlers {
            if let Err(e) = handler.close().await {
                debug!(error = %e, "handler close failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockContent, MockError};

    #[test]
    fn test_register_and_lookup_alias() {
        let registry = ResourceRegistry::new();
        registry.register_handler("cartService", Arc::new(MockContent::new("x")));

        assert!(registry.lookup_by_alias("cartService").is_some());
        // alias table is reachable under scheme case-folding
        assert!(registry.lookup_by_alias("CARTSERVICE").is_some());

        registry.deregister_alias("cartService");
        assert!(registry.lookup_by_alias("cartService").is_none());
    }

    #[test]
    fn test_resolve_unknown_scheme_is_not_supported() {
        let registry = ResourceRegistry::new();
        let err = match registry.resolve_resource("ftp://cart.service") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.is_not_supported(), "{err}");
    }

    #[test]
    fn test_resolve_unknown_alias_is_not_supported() {
        let registry = ResourceRegistry::new();
        let err = match registry.resolve_resource("awsRedisCartService") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.is_not_supported(), "{err}");
    }

    #[test]
    fn test_resolve_alias_via_scheme_syntax() {
        let registry = ResourceRegistry::new();
        registry.register_handler("testa1", Arc::new(MockContent::new("content")));
        assert!(registry.resolve_resource("testA1://micro1").is_ok());
    }

    #[test]
    fn test_factory_created_handler_is_cached() {
        let registry = ResourceRegistry::new();
        registry.register_scheme_factory(
            "mock",
            Box::new(|opts| Ok(Arc::new(MockContent::new(opts.url.clone())) as _)),
        );

        let a = registry.resolve_resource("mock://service/a").unwrap();
        let b = registry.resolve_resource("mock://service/a").unwrap();
        assert!(Arc::ptr_eq(&a, &b), "same URL must share one handler");

        let c = registry.resolve_resource("mock://service/c").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_new_handler_by_scheme_and_alias() {
        let registry = ResourceRegistry::new();
        registry.register_scheme_factory(
            "mock",
            Box::new(|opts| Ok(Arc::new(MockContent::new(opts.url.clone())) as _)),
        );

        let opts = ResourceOptions::new("mock://host/?db=0", "kvStore");
        let handler = registry.new_handler(&opts).unwrap();
        registry.register_handler(&opts.alias, handler);
        assert!(registry.lookup_by_alias("kvStore").is_some());

        let err = match registry.new_handler(&ResourceOptions::new("nothing-bound", "x")) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.is_not_supported());
    }

    #[tokio::test]
    async fn test_close_all_reports_first_error_and_is_idempotent() {
        let registry = ResourceRegistry::new();
        registry.register_handler("ok", Arc::new(MockContent::new("x")));
        registry.register_handler(
            "bad",
            Arc::new(MockError::closing(EsiError::AlreadyClosed("pool gone".into()))),
        );

        let err = registry.close_all().await.unwrap_err();
        assert!(err.is_transient());

        // Everything is drained; a second shutdown has nothing to fail on.
        assert!(registry.close_all().await.is_ok());
        assert!(registry.lookup_by_alias("ok").is_none());
    }
}
