//! Request processor
//!
//! Glues the pipeline together for one buffered response: select the path
//! scope, honor the method gate and the purge command, parse (or re-use)
//! the body's entities, fan the fetches out and splice the results into
//! the downstream sink. The host owns response buffering and calls
//! [`EsiProcessor::process`] once the upstream body is complete.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::io::Write;
use std::sync::{Arc, Mutex};

use http::header::HeaderName;
use http::HeaderMap;
use tracing::{debug, info, warn};

use crate::config::{EsiConfig, PathConfig};
use crate::entity::{Entities, TagDefaults};
use crate::error::{EsiError, Result};
use crate::esicache::CacheRegistry;
use crate::fetch::{CancelSignal, FetchEngine};
use crate::metrics::{EsiMetrics, MetricsSnapshot};
use crate::registry::ResourceRegistry;
use crate::resource::{RequestSnapshot, ResourceOptions};

/// The command value that evicts a scope's parse cache.
const CMD_PURGE: &str = "purge";

struct PathScope {
    config: PathConfig,
    defaults: TagDefaults,
    cmd_header: Option<HeaderName>,
    parse_cache: Mutex<HashMap<u64, Arc<Entities>>>,
}

impl PathScope {
    fn from_config(config: &PathConfig) -> Result<Self> {
        let cmd_header = if config.cmd_header_name.is_empty() {
            None
        } else {
            Some(
                HeaderName::from_bytes(config.cmd_header_name.to_ascii_lowercase().as_bytes())
                    .map_err(|_| {
                        EsiError::NotValid(format!(
                            "cmd_header_name {:?} is not a header name",
                            config.cmd_header_name
                        ))
                    })?,
            )
        };
        Ok(PathScope {
            defaults: config.tag_defaults()?,
            cmd_header,
            config: config.clone(),
            parse_cache: Mutex::new(HashMap::new()),
        })
    }
}

/// What [`EsiProcessor::process`] did with one response.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// False when the body passed through byte-for-byte
    pub transformed: bool,
    /// Bytes written to the sink
    pub bytes_written: usize,
    /// Backend headers selected for echoing onto the outer response
    pub response_headers: HeaderMap,
    /// Entities that served their on-error payload
    pub failed_entities: usize,
    /// Whether this request's command header purged the parse cache
    pub purged: bool,
}

/// The middleware core: one processor per host, shared across requests.
pub struct EsiProcessor {
    registry: Arc<ResourceRegistry>,
    caches: Arc<CacheRegistry>,
    engine: FetchEngine,
    metrics: Arc<EsiMetrics>,
    scopes: Vec<PathScope>,
}

impl EsiProcessor {
    /// A processor with one all-covering scope and default settings.
    pub fn new(registry: Arc<ResourceRegistry>) -> Result<Self> {
        Self::from_config(&EsiConfig::single_scope(), registry)
    }

    /// Build from a validated configuration: path scopes are compiled,
    /// resource aliases bound and caches registered.
    pub fn from_config(config: &EsiConfig, registry: Arc<ResourceRegistry>) -> Result<Self> {
        config.validate()?;

        let caches = Arc::new(CacheRegistry::new());
        let mut scopes = Vec::with_capacity(config.paths.len());
        for path_config in &config.paths {
            for binding in &path_config.resources {
                let opts = ResourceOptions::new(&binding.url, &binding.alias);
                let handler = registry.new_handler(&opts)?;
                registry.register_handler(&binding.alias, handler);
                info!(alias = %binding.alias, "bound backend resource");
            }
            for url in &path_config.cache_urls {
                caches.register_url(&path_config.path, url)?;
            }
            scopes.push(PathScope::from_config(path_config)?);
        }
        // Longest prefix first, so scope selection can take the first hit.
        scopes.sort_by(|a, b| b.config.path.len().cmp(&a.config.path.len()));

        let metrics = Arc::new(EsiMetrics::new());
        Ok(EsiProcessor {
            registry,
            caches,
            engine: FetchEngine::new(metrics.clone()),
            metrics,
            scopes,
        })
    }

    /// The counters of this processor.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The handler registry backing this processor.
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Shut down every backend handler. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.registry.close_all().await
    }

    /// Transform one buffered response body into `sink`.
    ///
    /// The body passes through unchanged when no scope matches, the
    /// method is not allowed, or the body carries no include markers.
    /// Parse errors return without writing anything: the host still owns
    /// the original bytes and is free to emit them unmodified. A `Fatal`
    /// fetch error and external cancellation propagate likewise.
    pub async fn process(
        &self,
        snapshot: &RequestSnapshot,
        body: &[u8],
        sink: &mut (dyn Write + Send),
        cancel: &CancelSignal,
    ) -> Result<ProcessOutcome> {
        let mut outcome = ProcessOutcome::default();

        let Some(scope) = self.select_scope(snapshot.uri.path()) else {
            return self.pass_through(body, sink, outcome);
        };
        if !scope.config.is_method_allowed(&snapshot.method) {
            debug!(method = %snapshot.method, scope = %scope.config.path, "method not allowed, passing through");
            return self.pass_through(body, sink, outcome);
        }

        if let Some(cmd_header) = &scope.cmd_header {
            let purge_requested = snapshot
                .headers
                .get(cmd_header)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case(CMD_PURGE))
                .unwrap_or(false);
            if purge_requested {
                let evicted = {
                    let mut cache = scope.parse_cache.lock().expect("parse cache lock poisoned");
                    let evicted = cache.len();
                    cache.clear();
                    evicted
                };
                self.metrics.record_purge();
                info!(scope = %scope.config.path, evicted, "parse cache purged by command header");
                outcome.purged = true;
            }
        }

        let entities = self.parsed_entities(scope, body)?;
        if entities.is_empty() {
            return self.pass_through(body, sink, outcome);
        }

        let fetched = self
            .engine
            .fetch_tags(&entities, snapshot, &self.caches, &scope.config.path, cancel)
            .await?;

        let mut tags = fetched.tags;
        outcome.bytes_written = tags.inject_content(body, sink)?;
        outcome.transformed = true;
        outcome.response_headers = fetched.response_headers;
        outcome.failed_entities = fetched.failed_entities;
        if outcome.failed_entities > 0 {
            warn!(
                scope = %scope.config.path,
                failed = outcome.failed_entities,
                "entities served their on-error payload"
            );
        }
        self.metrics.record_request(true);
        Ok(outcome)
    }

    fn pass_through(
        &self,
        body: &[u8],
        sink: &mut (dyn Write + Send),
        mut outcome: ProcessOutcome,
    ) -> Result<ProcessOutcome> {
        sink.write_all(body)
            .map_err(|e| EsiError::WriteFailed(format!("pass-through write: {}", e)))?;
        outcome.bytes_written = body.len();
        self.metrics.record_request(false);
        Ok(outcome)
    }

    /// The parsed entity set for the body, from the scope's cache when
    /// the same bytes were seen before. Insertion is idempotent; when two
    /// requests parse the same new body concurrently the last writer
    /// wins and both sets are equivalent.
    fn parsed_entities(&self, scope: &PathScope, body: &[u8]) -> Result<Arc<Entities>> {
        let key = body_fingerprint(body);
        {
            let cache = scope.parse_cache.lock().expect("parse cache lock poisoned");
            if let Some(entities) = cache.get(&key) {
                self.metrics.record_parse_cache(true);
                return Ok(entities.clone());
            }
        }
        self.metrics.record_parse_cache(false);

        let entities = Arc::new(Entities::parse(body, &scope.defaults, &self.registry)?);
        debug!(
            tags = entities.len(),
            fingerprint = %format_args!("{:016x}", entities.fingerprint()),
            "parsed response body"
        );
        let mut cache = scope.parse_cache.lock().expect("parse cache lock poisoned");
        cache.insert(key, entities.clone());
        Ok(entities)
    }

    fn select_scope(&self, path: &str) -> Option<&PathScope> {
        // Scopes are ordered longest-prefix first.
        self.scopes.iter().find(|s| s.config.matches_path(path))
    }
}

fn body_fingerprint(body: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(body);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockContent, MockCounting};
    use http::header::HeaderValue;

    fn processor_with(aliases: &[(&str, &str)]) -> EsiProcessor {
        let registry = Arc::new(ResourceRegistry::new());
        for (alias, content) in aliases {
            registry.register_handler(alias, Arc::new(MockContent::new(*content)));
        }
        EsiProcessor::new(registry).unwrap()
    }

    async fn run(processor: &EsiProcessor, snapshot: &RequestSnapshot, body: &[u8]) -> (ProcessOutcome, Vec<u8>) {
        let mut sink = Vec::new();
        let outcome = processor
            .process(snapshot, body, &mut sink, &CancelSignal::never())
            .await
            .unwrap();
        (outcome, sink)
    }

    #[tokio::test]
    async fn test_process_replaces_two_tags() {
        let processor = processor_with(&[("url1", "X"), ("url2", "Y")]);
        let body = br#"abcdefg<esi:include src="url1"/>u p<esi:include src="url2" />k"#;
        let snapshot = RequestSnapshot::get("http://site/page.html");

        let (outcome, sink) = run(&processor, &snapshot, body).await;
        assert!(outcome.transformed);
        assert_eq!(sink, b"abcdefgXu pYk");
        assert_eq!(outcome.bytes_written, sink.len());
        assert_eq!(outcome.failed_entities, 0);
    }

    #[tokio::test]
    async fn test_process_plain_body_passes_through() {
        let processor = processor_with(&[]);
        let body = b"<html><body>no markers</body></html>";
        let (outcome, sink) = run(&processor, &RequestSnapshot::get("http://site/"), body).await;
        assert!(!outcome.transformed);
        assert_eq!(sink, body);
        assert_eq!(processor.metrics().passthrough_requests, 1);
    }

    #[tokio::test]
    async fn test_process_method_gate() {
        let processor = processor_with(&[("url1", "X")]);
        let body = br#"<esi:include src="url1"/>"#;
        let mut snapshot = RequestSnapshot::get("http://site/page.html");
        snapshot.method = http::Method::POST;

        let (outcome, sink) = run(&processor, &snapshot, body).await;
        assert!(!outcome.transformed);
        assert_eq!(sink, body.as_ref());
    }

    #[tokio::test]
    async fn test_process_unbalanced_attributes_error_and_no_write() {
        let processor = processor_with(&[]);
        // A stray token leaves an odd number of attribute fields.
        let body = br#"pre<esi:include src="u1" stray />post"#;
        let mut sink = Vec::new();
        let err = processor
            .process(
                &RequestSnapshot::get("http://site/"),
                body,
                &mut sink,
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_valid(), "{err}");
        assert!(sink.is_empty(), "host decides what to emit on parse errors");
    }

    #[tokio::test]
    async fn test_process_parses_once_per_body() {
        let registry = Arc::new(ResourceRegistry::new());
        let backend = Arc::new(MockCounting::new("fragment"));
        registry.register_handler("svc", backend.clone());
        let processor = EsiProcessor::new(registry).unwrap();

        let body = br#"<p><esi:include src="svc://micro1"/></p>"#;
        let snapshot = RequestSnapshot::get("http://site/page.html");
        for _ in 0..5 {
            let (outcome, sink) = run(&processor, &snapshot, body).await;
            assert!(outcome.transformed);
            assert_eq!(sink, b"<p>fragment</p>");
        }

        let metrics = processor.metrics();
        assert_eq!(metrics.parse_cache_misses, 1);
        assert_eq!(metrics.parse_cache_hits, 4);
        // Every request still fetched; only parsing was cached.
        assert_eq!(backend.calls(), 5);
    }

    #[tokio::test]
    async fn test_process_purge_command() {
        let processor = processor_with(&[("svc", "fragment")]);
        let body = br#"<p><esi:include src="svc://micro1"/></p>"#;

        let snapshot = RequestSnapshot::get("http://site/page.html");
        run(&processor, &snapshot, body).await;
        run(&processor, &snapshot, body).await;

        let mut purge_snapshot = RequestSnapshot::get("http://site/page.html");
        purge_snapshot
            .headers
            .insert("x-esi-cmd", HeaderValue::from_static("purge"));
        let (outcome, sink) = run(&processor, &purge_snapshot, body).await;
        assert!(outcome.purged);
        assert_eq!(sink, b"<p>fragment</p>");

        let metrics = processor.metrics();
        assert_eq!(metrics.parse_cache_purges, 1);
        // Parse ran again after the purge: the purging request itself
        // re-parsed the evicted body.
        assert_eq!(metrics.parse_cache_misses, 2);
        assert_eq!(metrics.parse_cache_hits, 1);
    }

    #[tokio::test]
    async fn test_scope_selection_longest_prefix() {
        let registry = Arc::new(ResourceRegistry::new());
        registry.register_handler("svc", Arc::new(MockContent::new("frag")));
        let config = EsiConfig {
            paths: vec![
                PathConfig {
                    path: "/".into(),
                    ..PathConfig::default()
                },
                PathConfig {
                    path: "/admin".into(),
                    allowed_methods: vec![], // would fail validation
                    ..PathConfig::default()
                },
            ],
        };
        // An empty method list is rejected up front.
        assert!(EsiProcessor::from_config(&config, registry.clone()).is_err());

        let config = EsiConfig {
            paths: vec![
                PathConfig {
                    path: "/".into(),
                    ..PathConfig::default()
                },
                PathConfig {
                    path: "/admin".into(),
                    allowed_methods: vec!["POST".into()],
                    ..PathConfig::default()
                },
            ],
        };
        let processor = EsiProcessor::from_config(&config, registry).unwrap();
        let body = br#"<esi:include src="svc://x"/>"#;

        // GET on /admin hits the /admin scope, which only allows POST.
        let (outcome, sink) =
            run(&processor, &RequestSnapshot::get("http://site/admin/page"), body).await;
        assert!(!outcome.transformed);
        assert_eq!(sink, body.as_ref());

        // GET elsewhere is processed by the root scope.
        let (outcome, _) =
            run(&processor, &RequestSnapshot::get("http://site/shop/page"), body).await;
        assert!(outcome.transformed);
    }

    #[tokio::test]
    async fn test_scope_outside_all_paths_passes_through() {
        let registry = Arc::new(ResourceRegistry::new());
        registry.register_handler("svc", Arc::new(MockContent::new("frag")));
        let config = EsiConfig {
            paths: vec![PathConfig {
                path: "/catalog/categories".into(),
                ..PathConfig::default()
            }],
        };
        let processor = EsiProcessor::from_config(&config, registry).unwrap();
        let body = br#"<esi:include src="svc://x"/>"#;
        let (outcome, sink) =
            run(&processor, &RequestSnapshot::get("http://site/page01.html"), body).await;
        assert!(!outcome.transformed);
        assert_eq!(sink, body.as_ref());
    }
}
