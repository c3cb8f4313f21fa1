//! Fetch engine
//!
//! Resolves every entity of a page concurrently. Within one entity the
//! resources are tried in order under one shared deadline: a transient
//! failure records on that resource's circuit breaker and falls through
//! to the next candidate, an open breaker is skipped without a network
//! attempt, and the first payload wins. When everything fails the
//! entity's on-error bytes become the payload, so a broken backend
//! degrades one page fragment instead of the whole response.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::breaker::BreakerState;
use crate::coalesce::Coalescer;
use crate::entity::{Entities, Entity};
use crate::error::{EsiError, Result};
use crate::esicache::CacheRegistry;
use crate::injector::{DataTag, DataTags};
use crate::metrics::EsiMetrics;
use crate::resource::{RequestSnapshot, ResourceArgs};

/// The winning payload of one entity fetch.
#[derive(Debug, Clone)]
pub struct FetchPayload {
    /// Backend bytes, already truncated to the entity's limit
    pub data: Bytes,
    /// Return headers selected by the entity's policy; `None` when no
    /// echo was requested or the payload came from cache
    pub headers: Option<HeaderMap>,
    /// The rendered URL of the resource that answered; empty for cache hits
    pub source: String,
}

/// Everything the injector and the response writer need for one page.
#[derive(Debug, Default)]
pub struct FetchedTags {
    /// Splice instructions in `start` order
    pub tags: DataTags,
    /// Backend headers to merge onto the outer response
    pub response_headers: HeaderMap,
    /// Entities answered with their on-error payload
    pub failed_entities: usize,
}

/// Observes cancellation of the external request.
///
/// Hosts that cancel by dropping the processing future can pass
/// [`CancelSignal::never`]; hosts that need an explicit signal (a client
/// disconnect callback, say) keep the [`CancelHandle`].
#[derive(Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

/// The sending half; cancelling is idempotent.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// A connected handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
}

impl CancelHandle {
    /// Signal cancellation to every fetch watching the paired signal.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        CancelSignal { rx: None }
    }

    /// Resolve once cancellation is signalled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // The handle is gone; cancellation can no longer happen.
                return std::future::pending().await;
            }
        }
    }
}

struct EntityResult {
    tag: DataTag,
    headers: Option<HeaderMap>,
    failed: bool,
}

struct EngineInner {
    coalescer: Coalescer<FetchPayload>,
    metrics: Arc<EsiMetrics>,
}

/// Races each entity's resources and assembles the page's splice set.
/// Cheap to clone; clones share the coalescer and metrics.
#[derive(Clone)]
pub struct FetchEngine {
    inner: Arc<EngineInner>,
}

impl FetchEngine {
    pub fn new(metrics: Arc<EsiMetrics>) -> Self {
        FetchEngine {
            inner: Arc::new(EngineInner {
                coalescer: Coalescer::new(),
                metrics,
            }),
        }
    }

    /// The counters this engine reports into.
    pub fn metrics(&self) -> &Arc<EsiMetrics> {
        &self.inner.metrics
    }

    /// Fetch one entity: try its resources in order under the entity's
    /// shared deadline and return the first payload.
    ///
    /// Transient failures (`NotFound`, `Timeout`, `AlreadyClosed`,
    /// `Temporary`) record on the failing resource's breaker and yield to
    /// the next resource; `Fatal` aborts immediately. When every resource
    /// failed or sat behind an open breaker the result is `Temporary`.
    pub async fn query_entity(
        &self,
        entity: &Entity,
        snapshot: &RequestSnapshot,
    ) -> Result<FetchPayload> {
        let cfg = entity.config();
        let base_args = ResourceArgs {
            request: snapshot.clone(),
            url: String::new(),
            tag: entity.tag_args(&snapshot.headers),
        };
        let deadline = Instant::now() + cfg.timeout;
        let mut last_transient: Option<EsiError> = None;

        for resource in entity.resources() {
            let (state, last_failure) = resource.breaker().state();
            if state == BreakerState::Open {
                debug!(
                    resource = %resource,
                    failures = resource.breaker().failures(),
                    ?last_failure,
                    "circuit breaker open, skipping resource"
                );
                continue;
            }

            let mut args = base_args.clone();
            args.url = resource.render_url(&snapshot.headers);

            match timeout_at(deadline, resource.handler().do_request(&args)).await {
                Err(_) => {
                    // The shared budget is gone; later resources would
                    // start with nothing.
                    resource.breaker().record_failure();
                    self.inner.metrics.record_backend_fetch(false);
                    last_transient = Some(EsiError::Timeout(format!(
                        "resource {:?} exhausted the entity budget of {:?}",
                        args.url, cfg.timeout
                    )));
                    break;
                }
                Ok(Ok((backend_headers, mut data))) => {
                    if state == BreakerState::HalfOpen {
                        resource.breaker().reset();
                    }
                    self.inner.metrics.record_backend_fetch(true);
                    if data.len() as u64 > cfg.max_body_size {
                        data.truncate(cfg.max_body_size as usize);
                    }
                    let headers = backend_headers
                        .as_ref()
                        .and_then(|h| args.prepare_return_headers(h));
                    return Ok(FetchPayload {
                        data,
                        headers,
                        source: args.url,
                    });
                }
                Ok(Err(e)) if e.is_transient() => {
                    resource.breaker().record_failure();
                    self.inner.metrics.record_backend_fetch(false);
                    debug!(resource = %args.url, error = %e, "resource attempt failed");
                    last_transient = Some(e);
                }
                Ok(Err(e)) => {
                    self.inner.metrics.record_backend_fetch(false);
                    return Err(e);
                }
            }
        }

        Err(EsiError::Temporary(match last_transient {
            Some(e) => format!("all resources of the entity failed, last error: {}", e),
            None => "all resources of the entity sit behind open circuit breakers".to_string(),
        }))
    }

    /// Resolve every entity of a page concurrently into splice
    /// instructions, honoring per-entity caching and coalescing.
    ///
    /// A `Fatal` from any entity aborts everything, as does cancellation
    /// of the external request; any other per-entity failure substitutes
    /// that entity's on-error payload.
    pub async fn fetch_tags(
        &self,
        entities: &Entities,
        snapshot: &RequestSnapshot,
        caches: &Arc<CacheRegistry>,
        scope: &str,
        cancel: &CancelSignal,
    ) -> Result<FetchedTags> {
        if entities.is_empty() {
            return Ok(FetchedTags::default());
        }

        let snapshot = Arc::new(snapshot.clone());
        let scope: Arc<str> = Arc::from(scope);
        let mut set = JoinSet::new();
        for entity in entities.iter() {
            let engine = self.clone();
            let entity = entity.clone();
            let snapshot = snapshot.clone();
            let caches = caches.clone();
            let scope = scope.clone();
            set.spawn(async move { engine.fetch_one(entity, snapshot, caches, scope).await });
        }

        let mut tags = Vec::with_capacity(entities.len());
        let mut response_headers = HeaderMap::new();
        let mut failed_entities = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    set.abort_all();
                    return Err(EsiError::Temporary(
                        "external request cancelled while fetching entities".into(),
                    ));
                }
                joined = set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(Ok(result))) => {
                            if result.failed {
                                failed_entities += 1;
                            }
                            if let Some(headers) = result.headers {
                                for (name, value) in headers.iter() {
                                    response_headers.append(name.clone(), value.clone());
                                }
                            }
                            tags.push(result.tag);
                        }
                        Some(Ok(Err(e))) => {
                            set.abort_all();
                            return Err(e);
                        }
                        Some(Err(join_err)) => {
                            set.abort_all();
                            return Err(EsiError::Temporary(format!(
                                "entity fetch task failed: {}",
                                join_err
                            )));
                        }
                    }
                }
            }
        }

        Ok(FetchedTags {
            tags: DataTags::new(tags),
            response_headers,
            failed_entities,
        })
    }

    async fn fetch_one(
        &self,
        entity: Arc<Entity>,
        snapshot: Arc<RequestSnapshot>,
        caches: Arc<CacheRegistry>,
        scope: Arc<str>,
    ) -> Result<EntityResult> {
        let cfg = entity.config();
        let (start, end) = entity.range();
        let fingerprint = entity.fingerprint();
        let cache_key = format!("esi:{:016x}", fingerprint);

        if cfg.ttl > Duration::ZERO {
            if let Some(data) = caches.get(&scope, &cache_key).await {
                self.inner.metrics.record_cache(true);
                return Ok(EntityResult {
                    tag: DataTag::new(data, start, end),
                    headers: None,
                    failed: false,
                });
            }
            self.inner.metrics.record_cache(false);
        }

        let outcome = if cfg.coalesce {
            let engine = self.clone();
            let entity_for_fetch = entity.clone();
            let snapshot_for_fetch = snapshot.clone();
            let (result, drove) = self
                .inner
                .coalescer
                .run(fingerprint, move || async move {
                    engine
                        .query_entity(&entity_for_fetch, &snapshot_for_fetch)
                        .await
                })
                .await;
            if !drove {
                self.inner.metrics.record_coalesce_join();
            }
            result
        } else {
            self.query_entity(&entity, &snapshot).await
        };

        match outcome {
            Ok(payload) => {
                if cfg.ttl > Duration::ZERO && !payload.data.is_empty() {
                    caches.set(&scope, &cache_key, &payload.data, cfg.ttl).await;
                }
                let data = if cfg.print_debug {
                    wrap_debug(&payload)
                } else {
                    payload.data
                };
                Ok(EntityResult {
                    tag: DataTag::new(data, start, end),
                    headers: payload.headers,
                    failed: false,
                })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(start, end, error = %e, "entity failed, serving on-error payload");
                self.inner.metrics.record_on_error_served();
                Ok(EntityResult {
                    tag: DataTag::new(cfg.on_error.clone(), start, end),
                    headers: None,
                    failed: true,
                })
            }
        }
    }
}

fn wrap_debug(payload: &FetchPayload) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.data.len() + payload.source.len() + 48);
    buf.extend_from_slice(b"<!-- esi fragment from \"");
    buf.extend_from_slice(payload.source.as_bytes());
    buf.extend_from_slice(b"\" -->");
    buf.extend_from_slice(&payload.data);
    buf.extend_from_slice(b"<!-- /esi fragment -->");
    buf.freeze()
}
