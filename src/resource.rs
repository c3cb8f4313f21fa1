//! Backend resources and the uniform request contract
//!
//! A [`Resource`] is one destination candidate inside an entity: a literal
//! or templated URL, the handler that can talk to it, and a circuit breaker
//! accounting its failures. [`ResourceArgs`] is the uniform request shape
//! every handler receives, whether it fronts an HTTP microservice or a
//! key/value store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderMap, Method, Uri};

use crate::breaker::CircuitBreaker;
use crate::error::{EsiError, Result};
use crate::template::Template;
use crate::util;

/// Headers never forwarded to a backend: hop-by-hop headers plus cache
/// directives that describe the outer exchange, not the subrequest.
const FORWARD_SKIP: &[&str] = &[
    "cache-control",
    "connection",
    "host",
    "keep-alive",
    "pragma",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers never echoed from a backend response onto the outer response:
/// hop-by-hop headers and entity metadata of the backend's own body.
const RETURN_SKIP: &[&str] = &[
    "cache-control",
    "connection",
    "content-encoding",
    "content-length",
    "content-type",
    "date",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "strict-transport-security",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Backend handler contract.
///
/// Handlers are shared process-wide across requests and must be
/// thread-safe. `close` is invoked once per handler at shutdown and must be
/// idempotent.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Perform one fetch. The returned body never exceeds
    /// `args.tag.max_body_size`; the header map is `None` for backends
    /// without a header concept (key/value stores).
    async fn do_request(&self, args: &ResourceArgs) -> Result<(Option<HeaderMap>, Bytes)>;

    /// Release connections and other driver state.
    async fn close(&self) -> Result<()>;
}

/// Factory input when a handler is created from configuration.
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    /// Destination URL, including backend-specific query parameters
    /// (`max_active`, `idle_timeout`, `db`, `cancellable`, `lazy`, ...)
    pub url: String,
    /// Name under which the handler is registered
    pub alias: String,
}

impl ResourceOptions {
    /// Options for a URL registered under an alias.
    pub fn new(url: impl Into<String>, alias: impl Into<String>) -> Self {
        ResourceOptions {
            url: url.into(),
            alias: alias.into(),
        }
    }
}

/// The parts of the incoming request a backend fetch may observe. The core
/// never holds the host server's request type; the host snapshots what the
/// templates and header policies need.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    /// Request method, used for the allowed-methods gate
    pub method: Method,
    /// Request URI, used for path-scope selection
    pub uri: Uri,
    /// Request headers, used by templates and forward-header snapshots
    pub headers: HeaderMap,
    /// Buffered request body, forwarded when a tag sets `forwardpostdata`
    pub body: Option<Bytes>,
}

impl RequestSnapshot {
    /// Snapshot from explicit parts.
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        RequestSnapshot {
            method,
            uri,
            headers,
            body: None,
        }
    }

    /// A GET snapshot with no headers; the common case in tests.
    pub fn get(uri: &str) -> Self {
        RequestSnapshot {
            method: Method::GET,
            uri: uri.parse().unwrap_or_default(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Attach the buffered request body.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// Per-tag configuration a handler may consult during one fetch.
#[derive(Debug, Clone)]
pub struct TagArgs {
    /// Budget for the whole entity fetch, shared across its resources
    pub timeout: Duration,
    /// Truncation limit for the backend payload, in bytes
    pub max_body_size: u64,
    /// Rendered lookup key for key/value backends
    pub key: Option<String>,
    /// Explicit forward-header list (canonical names)
    pub forward_headers: Vec<String>,
    /// Forward every header not on the skip list
    pub forward_headers_all: bool,
    /// Explicit return-header list (canonical names)
    pub return_headers: Vec<String>,
    /// Echo every backend header not on the skip list
    pub return_headers_all: bool,
    /// Forward the external request's body to the backend
    pub forward_post_data: bool,
}

impl Default for TagArgs {
    fn default() -> Self {
        TagArgs {
            timeout: Duration::ZERO,
            max_body_size: 0,
            key: None,
            forward_headers: Vec::new(),
            forward_headers_all: false,
            return_headers: Vec::new(),
            return_headers_all: false,
            forward_post_data: false,
        }
    }
}

/// Everything a handler needs for one fetch.
#[derive(Debug, Clone)]
pub struct ResourceArgs {
    /// Snapshot of the external request
    pub request: RequestSnapshot,
    /// Rendered destination URL, or the alias for alias-bound resources
    pub url: String,
    /// Owning entity's fetch configuration
    pub tag: TagArgs,
}

impl ResourceArgs {
    /// Validate the argument invariants every handler may rely on.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(EsiError::Empty("resource args URL value".into()));
        }
        if self.tag.timeout == Duration::ZERO {
            return Err(EsiError::Empty(format!(
                "resource args timeout value for URL {:?}",
                self.url
            )));
        }
        if self.tag.max_body_size == 0 {
            return Err(EsiError::Empty(format!(
                "resource args maxBodySize value for URL {:?}",
                self.url
            )));
        }
        Ok(())
    }

    /// Validate plus require the key/value lookup key.
    pub fn validate_with_key(&self) -> Result<()> {
        self.validate()?;
        match &self.tag.key {
            Some(k) if !k.is_empty() => Ok(()),
            _ => Err(EsiError::Empty(format!(
                "resource args key value for URL {:?}",
                self.url
            ))),
        }
    }

    /// The truncation limit in human-readable form, for debug output.
    pub fn max_body_size_humanized(&self) -> String {
        util::format_bytes(self.tag.max_body_size)
    }

    /// Snapshot of the external request's headers for forwarding.
    ///
    /// Returns a flat, alphabetically ordered `(name, value)` list with
    /// canonical names. `all` overrides the explicit list. Skip-listed
    /// headers are dropped either way; multi-valued headers (`Cookie`)
    /// contribute one pair per value.
    pub fn prepare_forward_headers(&self) -> Vec<(String, String)> {
        if !self.tag.forward_headers_all && self.tag.forward_headers.is_empty() {
            return Vec::new();
        }

        let mut sorted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if self.tag.forward_headers_all {
            for (name, value) in self.request.headers.iter() {
                if is_skipped(FORWARD_SKIP, name.as_str()) {
                    continue;
                }
                if let Ok(v) = value.to_str() {
                    sorted
                        .entry(util::canonical_header_key(name.as_str()))
                        .or_default()
                        .push(v.to_owned());
                }
            }
        } else {
            for wanted in &self.tag.forward_headers {
                if is_skipped(FORWARD_SKIP, wanted) {
                    continue;
                }
                let Ok(name) = HeaderName::from_bytes(wanted.to_ascii_lowercase().as_bytes())
                else {
                    continue;
                };
                for value in self.request.headers.get_all(&name) {
                    if let Ok(v) = value.to_str() {
                        sorted
                            .entry(util::canonical_header_key(wanted))
                            .or_default()
                            .push(v.to_owned());
                    }
                }
            }
        }

        let mut out = Vec::new();
        for (name, mut values) in sorted {
            values.sort();
            for v in values {
                out.push((name.clone(), v));
            }
        }
        out
    }

    /// Select which backend response headers are echoed onto the outer
    /// response. Returns `None` when no echo was requested; skip-listed
    /// headers are never echoed.
    pub fn prepare_return_headers(&self, backend: &HeaderMap) -> Option<HeaderMap> {
        if !self.tag.return_headers_all && self.tag.return_headers.is_empty() {
            return None;
        }

        let mut out = HeaderMap::new();
        if self.tag.return_headers_all {
            for (name, value) in backend.iter() {
                if is_skipped(RETURN_SKIP, name.as_str()) {
                    continue;
                }
                out.append(name.clone(), value.clone());
            }
        } else {
            for wanted in &self.tag.return_headers {
                if is_skipped(RETURN_SKIP, wanted) {
                    continue;
                }
                let Ok(name) = HeaderName::from_bytes(wanted.to_ascii_lowercase().as_bytes())
                else {
                    continue;
                };
                for value in backend.get_all(&name) {
                    out.append(name.clone(), value.clone());
                }
            }
        }
        Some(out)
    }
}

fn is_skipped(skip: &[&str], name: &str) -> bool {
    skip.iter().any(|s| s.eq_ignore_ascii_case(name))
}

/// One destination candidate within an entity.
pub struct Resource {
    index: usize,
    url: Template,
    scheme_or_alias: String,
    handler: Arc<dyn ResourceHandler>,
    breaker: CircuitBreaker,
}

impl Resource {
    /// Build a resource from its position, raw `src` value and resolved
    /// handler. The URL template compiles here, once.
    pub fn new(index: usize, url: &str, handler: Arc<dyn ResourceHandler>) -> Result<Self> {
        let template = Template::compile(url)?;
        Ok(Resource {
            index,
            scheme_or_alias: scheme_or_alias(url),
            url: template,
            handler,
            breaker: CircuitBreaker::new(),
        })
    }

    /// Position of this resource within its entity; unique per entity.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The raw `src` value as written in the tag.
    pub fn url(&self) -> &str {
        self.url.raw()
    }

    /// Render the destination URL against the incoming request's headers.
    pub fn render_url(&self, headers: &HeaderMap) -> String {
        self.url.render(headers)
    }

    /// Lowercased scheme, or the alias verbatim for scheme-less sources.
    pub fn scheme_or_alias(&self) -> &str {
        &self.scheme_or_alias
    }

    /// The shared backend driver behind this resource.
    pub fn handler(&self) -> &Arc<dyn ResourceHandler> {
        &self.handler
    }

    /// This resource's failure accounting.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.raw())
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("index", &self.index)
            .field("url", &self.url.raw())
            .field("scheme_or_alias", &self.scheme_or_alias)
            .finish()
    }
}

/// The lowercased scheme of a URL, or the whole value for scheme-less
/// aliases.
pub fn scheme_or_alias(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, _)) => scheme.to_ascii_lowercase(),
        None => url.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn extended_request() -> RequestSnapshot {
        let mut headers = HeaderMap::new();
        let pairs: &[(&str, &str)] = &[
            ("host", "www.example.com"),
            ("connection", "keep-alive"),
            ("pragma", "no-cache"),
            ("cache-control", "no-cache"),
            ("upgrade-insecure-requests", "1"),
            ("user-agent", "Mozilla/5.0 (Macintosh; Intel Mac OS X 10)"),
            ("accept", "text/html,application/xhtml+xml"),
            ("dnt", "1"),
            ("referer", "https://www.example.com/"),
            ("accept-encoding", "gzip, deflate, sdch, br"),
            ("accept-language", "en-US,en;q=0.8"),
            ("cookie", "x-wl-uid=1vnTVF5WyZIe5Fymf2a4H"),
            ("cookie", "session-token=AIo5Vf; JSESSIONID=58B7C7A2"),
        ];
        for (k, v) in pairs {
            headers.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        RequestSnapshot::new(Method::GET, "https://host.example/any/path".parse().unwrap(), headers)
    }

    fn backend_response_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        let pairs: &[(&str, &str)] = &[
            ("server", "Server"),
            ("date", "Mon, 02 Jan 2017 08:58:08 GMT"),
            ("content-type", "text/html;charset=UTF-8"),
            ("transfer-encoding", "chunked"),
            ("connection", "keep-alive"),
            ("strict-transport-security", "max-age=47474747"),
            ("x-dmz-id-1", "XBXAV6DKR823M418TZ8Y"),
            ("x-frame-options", "SAMEORIGIN"),
            ("cache-control", "no-transform"),
            ("content-encoding", "gzip"),
            ("vary", "Accept-Encoding,User-Agent"),
            ("set-cookie", "ubid-acbde=253-9771841-6878311; Path=/"),
            ("x-sdch-encode", "0"),
        ];
        for (k, v) in pairs {
            headers.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        headers
    }

    fn args_with_tag(tag: TagArgs) -> ResourceArgs {
        ResourceArgs {
            request: extended_request(),
            url: "http://whatever.anydomain/page.html".into(),
            tag,
        }
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let args = ResourceArgs {
            request: RequestSnapshot::get("http://x/"),
            url: String::new(),
            tag: TagArgs::default(),
        };
        let err = args.validate().unwrap_err();
        assert!(err.is_empty());
        assert!(err.to_string().contains("URL value"));

        let args = ResourceArgs {
            url: "http://www".into(),
            ..args
        };
        let err = args.validate().unwrap_err();
        assert!(err.to_string().contains("timeout value"));

        let mut args = args;
        args.tag.timeout = Duration::from_secs(1);
        let err = args.validate().unwrap_err();
        assert!(err.to_string().contains("maxBodySize value"));

        args.tag.max_body_size = 5;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validate_with_key() {
        let mut args = args_with_tag(TagArgs {
            timeout: Duration::from_secs(1),
            max_body_size: 5,
            ..TagArgs::default()
        });
        assert!(args.validate_with_key().unwrap_err().is_empty());
        args.tag.key = Some("product_1".into());
        assert!(args.validate_with_key().is_ok());
    }

    #[test]
    fn test_max_body_size_humanized() {
        let args = args_with_tag(TagArgs {
            max_body_size: 123_456_789,
            ..TagArgs::default()
        });
        assert_eq!(args.max_body_size_humanized(), "123 MB");
    }

    #[test]
    fn test_forward_headers_none_requested() {
        let args = args_with_tag(TagArgs {
            timeout: Duration::from_secs(1),
            max_body_size: 15,
            ..TagArgs::default()
        });
        assert!(args.prepare_forward_headers().is_empty());
    }

    #[test]
    fn test_forward_headers_all() {
        let args = args_with_tag(TagArgs {
            timeout: Duration::from_secs(1),
            max_body_size: 15,
            forward_headers_all: true,
            // the explicit list is ignored when `all` is set
            forward_headers: vec!["Cookie".into()],
            ..TagArgs::default()
        });
        let have = args.prepare_forward_headers();

        let names: Vec<&str> = have.iter().map(|(k, _)| k.as_str()).collect();
        assert!(!names.contains(&"Host"));
        assert!(!names.contains(&"Connection"));
        assert!(!names.contains(&"Pragma"));
        assert!(!names.contains(&"Cache-Control"));
        assert!(names.contains(&"Upgrade-Insecure-Requests"));

        // Alphabetical order, Cookie preserved as two pairs.
        assert_eq!(names.iter().filter(|n| **n == "Cookie").count(), 2);
        let mut sorted_names = names.clone();
        sorted_names.sort();
        assert_eq!(names, sorted_names);
        assert_eq!(have.len(), 9);
    }

    #[test]
    fn test_forward_headers_some() {
        let args = args_with_tag(TagArgs {
            timeout: Duration::from_secs(1),
            max_body_size: 15,
            // Pragma is on the skip list and gets dropped
            forward_headers: vec!["Cookie".into(), "Pragma".into()],
            ..TagArgs::default()
        });
        let have = args.prepare_forward_headers();
        assert_eq!(have.len(), 2);
        assert!(have.iter().all(|(k, _)| k == "Cookie"));
    }

    #[test]
    fn test_return_headers_none_requested() {
        let args = args_with_tag(TagArgs::default());
        assert!(args.prepare_return_headers(&backend_response_headers()).is_none());
    }

    #[test]
    fn test_return_headers_all() {
        let args = args_with_tag(TagArgs {
            return_headers_all: true,
            return_headers: vec!["Set-Cookie".into()], // ignored
            ..TagArgs::default()
        });
        let have = args.prepare_return_headers(&backend_response_headers()).unwrap();

        assert_eq!(have.len(), 6);
        assert!(have.contains_key("set-cookie"));
        assert!(have.contains_key("x-dmz-id-1"));
        assert!(have.contains_key("server"));
        assert!(have.contains_key("vary"));
        assert!(have.contains_key("x-frame-options"));
        assert!(have.contains_key("x-sdch-encode"));
        assert!(!have.contains_key("content-type"));
        assert!(!have.contains_key("date"));
    }

    #[test]
    fn test_return_headers_some() {
        let args = args_with_tag(TagArgs {
            // Connection is on the skip list and gets dropped
            return_headers: vec!["Set-Cookie".into(), "Connection".into()],
            ..TagArgs::default()
        });
        let have = args.prepare_return_headers(&backend_response_headers()).unwrap();
        assert_eq!(have.len(), 1);
        assert!(have.contains_key("set-cookie"));
    }

    #[test]
    fn test_scheme_or_alias() {
        assert_eq!(scheme_or_alias("HTTP://host/x"), "http");
        assert_eq!(scheme_or_alias("redis://localhost:6379/0"), "redis");
        assert_eq!(scheme_or_alias("awsRedisCartService"), "awsRedisCartService");
    }
}
