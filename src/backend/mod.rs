//! Default backend handlers
//!
//! The registry ships factories for `http`/`https` (one shared connection
//! pool) and `redis`. Other schemes — `memcache`, `grpc`, anything
//! site-specific — are registered by the host through
//! [`crate::registry::ResourceRegistry::register_scheme_factory`] or an
//! alias binding.

pub mod http;
pub mod redis;

use std::sync::Arc;

use crate::error::Result;
use crate::registry::ResourceRegistry;
use crate::resource::ResourceHandler;

/// A registry with the default scheme factories installed.
pub fn default_registry() -> Result<ResourceRegistry> {
    let registry = ResourceRegistry::new();
    register_default_factories(&registry)?;
    Ok(registry)
}

/// Install the `http`, `https` and `redis` factories. The HTTP factory
/// hands every handler a clone of one shared client, so all HTTP
/// resources use one connection pool.
pub fn register_default_factories(registry: &ResourceRegistry) -> Result<()> {
    let client = http::build_client()?;
    for scheme in ["http", "https"] {
        let client = client.clone();
        registry.register_scheme_factory(
            scheme,
            Box::new(move |_opts| {
                Ok(Arc::new(http::HttpHandler::with_client(client.clone()))
                    as Arc<dyn ResourceHandler>)
            }),
        );
    }
    registry.register_scheme_factory(
        "redis",
        Box::new(|opts| Ok(Arc::new(redis::RedisHandler::new(opts)?) as Arc<dyn ResourceHandler>)),
    );
    Ok(())
}
