//! ESI Stitch
//!
//! A response-transformation middleware core: it discovers
//! `<esi:include ... />` markers in buffered HTML responses, fetches each
//! marker's content concurrently from one of several named backend
//! resources (HTTP microservices or key/value stores) and splices the
//! fetched bytes back into the response at the exact original byte
//! ranges.
//!
//! # Overview
//!
//! The host server buffers the upstream response and hands the complete
//! body to [`EsiProcessor::process`] together with a snapshot of the
//! incoming request and a downstream byte sink. Everything else — tag
//! discovery, attribute parsing, backend racing, circuit breaking,
//! coalescing, caching and splicing — happens inside this crate.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use esi_stitch::{backend, CancelSignal, EsiProcessor, RequestSnapshot};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Default factories: http, https, redis.
//! let registry = Arc::new(backend::default_registry()?);
//! let processor = EsiProcessor::new(registry)?;
//!
//! let body = br#"<p><esi:include src="https://micro.service/cart" timeout="150ms"/></p>"#;
//! let snapshot = RequestSnapshot::get("https://shop.example/checkout");
//!
//! let mut sink = Vec::new();
//! let outcome = processor
//!     .process(&snapshot, body, &mut sink, &CancelSignal::never())
//!     .await?;
//! println!("transformed: {}", outcome.transformed);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`scanner`]: locates include markers across arbitrary chunk
//!   boundaries
//! - [`attributes`]: splits a marker's raw attribute blob into pairs
//! - [`entity`]: builds typed [`Entity`] values and the per-page
//!   [`Entities`] set with its order-sensitive fingerprint
//! - [`registry`]: scheme factories, alias bindings and handler shutdown
//! - [`breaker`]: per-resource lock-free circuit breaker
//! - [`fetch`]: races each entity's resources under one shared deadline
//! - [`coalesce`]: deduplicates concurrent fetches by fingerprint
//! - [`esicache`]: optional short-term result caching with TTL
//! - [`injector`]: splices fetched payloads into the streamed body
//! - [`processor`]: per-request orchestration, parse cache and the purge
//!   command
//!
//! # Tag surface
//!
//! ```html
//! <esi:include src="https://micro.service/cart"
//!              src="redisFallback" key="cart_{HUser-Agent}"
//!              timeout="150ms" ttl="5s" maxbodysize="10kb"
//!              onerror="cart unavailable" coalesce="true"
//!              forwardheaders="Cookie,Accept-Language" returnheaders="Set-Cookie" />
//! ```
//!
//! Unknown attribute keys abort the parse unless they start with `x`.
//! Values may be single- or double-quoted; `src` and `key` accept
//! `{H<Header-Name>}` placeholders rendered from the incoming request.

pub mod attributes;
pub mod backend;
pub mod breaker;
pub mod coalesce;
pub mod config;
pub mod entity;
pub mod error;
pub mod esicache;
pub mod fetch;
pub mod injector;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod registry;
pub mod resource;
pub mod scanner;
pub mod template;
pub mod testing;
pub mod util;

// Re-export the types a host touches.
pub use breaker::{BreakerState, CircuitBreaker};
pub use config::{EsiConfig, PathConfig, ResourceBinding};
pub use entity::{Entities, Entity, TagConfig, TagDefaults};
pub use error::{EsiError, Result};
pub use esicache::{CacheRegistry, Cacher, MemoryCache};
pub use fetch::{cancel_pair, CancelHandle, CancelSignal, FetchEngine, FetchPayload};
pub use injector::{DataTag, DataTags};
pub use metrics::{EsiMetrics, MetricsSnapshot};
pub use processor::{EsiProcessor, ProcessOutcome};
pub use registry::{HandlerFactory, ResourceRegistry};
pub use resource::{
    RequestSnapshot, Resource, ResourceArgs, ResourceHandler, ResourceOptions, TagArgs,
};
pub use scanner::{RawMarker, TagScanner};
pub use template::Template;
