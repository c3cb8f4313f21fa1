//! Parsed include entities
//!
//! An [`Entity`] is the in-memory form of one `<esi:include .../>` marker:
//! its raw attribute bytes, the byte range it occupies in the originating
//! body, an ordered list of backend [`Resource`]s and the typed per-tag
//! configuration. [`Entities`] is the ordered set for one page, addressed
//! by an order-sensitive 64-bit fingerprint.
//!
//! Entities are immutable once built and shared across requests via the
//! parse cache.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use tracing::trace;

use crate::attributes::split_attributes;
use crate::error::{EsiError, Result};
use crate::registry::ResourceRegistry;
use crate::resource::{Resource, TagArgs};
use crate::scanner::{self, RawMarker};
use crate::template::Template;
use crate::util;

/// Fallback entity timeout when neither the tag nor the path sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Fallback payload truncation limit: 5 MB.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 5 * 1024 * 1024;

/// Bytes shown in place of a tag when every resource failed and the tag
/// carries no `onerror` of its own.
pub const DEFAULT_ON_ERROR: &str = "esi backend unavailable, please try again later.";

/// Per-path defaults merged into each entity at build time.
#[derive(Debug, Clone)]
pub struct TagDefaults {
    /// Entity fetch budget when the tag has no `timeout`
    pub timeout: Duration,
    /// Result cache TTL when the tag has no `ttl`; zero disables caching
    pub ttl: Duration,
    /// Payload truncation limit when the tag has no `maxbodysize`
    pub max_body_size: u64,
    /// Failure payload when the tag has no `onerror`
    pub on_error: Bytes,
}

impl Default for TagDefaults {
    fn default() -> Self {
        TagDefaults {
            timeout: DEFAULT_TIMEOUT,
            ttl: Duration::ZERO,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            on_error: Bytes::from_static(DEFAULT_ON_ERROR.as_bytes()),
        }
    }
}

/// Typed configuration of one entity after defaults are applied.
///
/// Invariants once built: `timeout > 0`, `max_body_size > 0`.
#[derive(Debug, Clone)]
pub struct TagConfig {
    /// Fetch budget shared across all of the entity's resources
    pub timeout: Duration,
    /// Result cache TTL; zero disables caching for this entity
    pub ttl: Duration,
    /// Payload truncation limit in bytes
    pub max_body_size: u64,
    /// Lookup key template for key/value backends
    pub key: Option<Template>,
    /// Bytes spliced in on total failure
    pub on_error: Bytes,
    /// Canonicalized header names copied into backend requests
    pub forward_headers: Vec<String>,
    /// Forward all headers; overrides the explicit list
    pub forward_headers_all: bool,
    /// Canonicalized backend header names re-exposed on the response
    pub return_headers: Vec<String>,
    /// Echo all backend headers; overrides the explicit list
    pub return_headers_all: bool,
    /// Forward the external request's body to the backend
    pub forward_post_data: bool,
    /// Deduplicate concurrent fetches of this tag across requests
    pub coalesce: bool,
    /// Append fetch diagnostics as an HTML comment
    pub print_debug: bool,
}

/// One parsed include marker.
pub struct Entity {
    raw_attributes: Bytes,
    start: usize,
    end: usize,
    resources: Vec<Resource>,
    config: TagConfig,
}

impl Entity {
    /// Build an entity from a scanner record.
    ///
    /// Attribute errors abort the build: a malformed value is `NotValid`,
    /// an unknown key is `NotSupported` (keys starting with `x` excepted),
    /// a missing `src` is `Empty`, and an `onerror` file that cannot be
    /// read is `Fatal`.
    pub fn build(
        marker: &RawMarker,
        defaults: &TagDefaults,
        registry: &ResourceRegistry,
    ) -> Result<Entity> {
        let raw = std::str::from_utf8(&marker.raw_attributes).map_err(|_| {
            EsiError::NotValid("attribute bytes are not valid UTF-8".to_string())
        })?;
        let pairs = split_attributes(raw)?;

        let mut srcs: Vec<String> = Vec::new();
        let mut config = TagConfig {
            timeout: defaults.timeout,
            ttl: defaults.ttl,
            max_body_size: defaults.max_body_size,
            key: None,
            on_error: defaults.on_error.clone(),
            forward_headers: Vec::new(),
            forward_headers_all: false,
            return_headers: Vec::new(),
            return_headers_all: false,
            forward_post_data: false,
            coalesce: false,
            print_debug: false,
        };

        for kv in pairs.chunks_exact(2) {
            let (key, value) = (kv[0].as_str(), kv[1].as_str());
            match key {
                "src" => srcs.push(value.to_owned()),
                "key" => config.key = Some(Template::compile(value)?),
                "timeout" => config.timeout = util::parse_duration(value)?,
                "ttl" => config.ttl = util::parse_duration(value)?,
                "maxbodysize" => config.max_body_size = util::parse_bytes(value)?,
                "onerror" => config.on_error = load_on_error_value(value)?,
                "forwardheaders" => {
                    if value.trim().eq_ignore_ascii_case("all") {
                        config.forward_headers_all = true;
                    } else {
                        config.forward_headers = canonical_list(value);
                    }
                }
                "returnheaders" => {
                    if value.trim().eq_ignore_ascii_case("all") {
                        config.return_headers_all = true;
                    } else {
                        config.return_headers = canonical_list(value);
                    }
                }
                "forwardpostdata" => config.forward_post_data = parse_bool(key, value)?,
                "coalesce" => config.coalesce = parse_bool(key, value)?,
                "printdebug" => config.print_debug = parse_bool(key, value)?,
                _ if key.starts_with('x') => {
                    trace!(key, "ignoring extension attribute");
                }
                _ => {
                    return Err(EsiError::NotSupported(format!(
                        "unknown attribute {:?} in tag {:?}",
                        key, raw
                    )))
                }
            }
        }

        if srcs.is_empty() {
            return Err(EsiError::Empty(format!(
                "missing src attribute in tag {:?}",
                raw
            )));
        }
        if config.timeout == Duration::ZERO {
            return Err(EsiError::NotValid(format!(
                "timeout must be positive in tag {:?}",
                raw
            )));
        }
        if config.max_body_size == 0 {
            return Err(EsiError::NotValid(format!(
                "maxbodysize must be positive in tag {:?}",
                raw
            )));
        }

        let mut resources = Vec::with_capacity(srcs.len());
        for (index, url) in srcs.iter().enumerate() {
            let handler = registry.resolve_resource(url)?;
            resources.push(Resource::new(index, url, handler)?);
        }

        Ok(Entity {
            raw_attributes: marker.raw_attributes.clone(),
            start: marker.start,
            end: marker.end,
            resources,
            config,
        })
    }

    /// The bytes between `<esi:` and `/>` as scanned.
    pub fn raw_attributes(&self) -> &Bytes {
        &self.raw_attributes
    }

    /// Absolute byte range `[start, end)` of the whole marker.
    pub fn range(&self) -> (usize, usize) {
        (self.start, self.end)
    }

    /// The ordered destination candidates. Never empty; each resource's
    /// index equals its position.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// The typed tag configuration.
    pub fn config(&self) -> &TagConfig {
        &self.config
    }

    /// 64-bit hash of this entity's raw attributes; the result-cache and
    /// coalescer key.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write(&self.raw_attributes);
        hasher.finish()
    }

    /// The per-fetch view of this entity's configuration, with the lookup
    /// key rendered against the request's headers.
    pub fn tag_args(&self, headers: &HeaderMap) -> TagArgs {
        TagArgs {
            timeout: self.config.timeout,
            max_body_size: self.config.max_body_size,
            key: self.config.key.as_ref().map(|t| t.render(headers)),
            forward_headers: self.config.forward_headers.clone(),
            forward_headers_all: self.config.forward_headers_all,
            return_headers: self.config.return_headers.clone(),
            return_headers_all: self.config.return_headers_all,
            forward_post_data: self.config.forward_post_data,
        }
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("raw_attributes", &String::from_utf8_lossy(&self.raw_attributes))
            .field("start", &self.start)
            .field("end", &self.end)
            .field("resources", &self.resources)
            .finish()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => Err(EsiError::NotValid(format!(
            "attribute {:?} is not a boolean: {:?}",
            key, value
        ))),
    }
}

fn canonical_list(value: &str) -> Vec<String> {
    util::comma_list(value)
        .iter()
        .map(|name| util::canonical_header_key(name))
        .collect()
}

/// An on-error value is literal text unless it names an `.html` file, in
/// which case the file's bytes are loaded at parse time. A missing file
/// is `Fatal`.
pub(crate) fn load_on_error_value(value: &str) -> Result<Bytes> {
    if !value.ends_with(".html") {
        return Ok(Bytes::copy_from_slice(value.as_bytes()));
    }
    std::fs::read(value)
        .map(Bytes::from)
        .map_err(|e| EsiError::Fatal(format!("cannot read onerror file {:?}: {}", value, e)))
}

/// The ordered entity set of one page.
#[derive(Debug, Clone, Default)]
pub struct Entities {
    items: Vec<Arc<Entity>>,
}

impl Entities {
    /// Scan a buffered body and build every complete marker in it.
    ///
    /// Returns the empty set for a body without markers. Any build error
    /// aborts the whole parse; no partial sets are returned.
    pub fn parse(body: &[u8], defaults: &TagDefaults, registry: &ResourceRegistry) -> Result<Entities> {
        let markers = scanner::scan(body);
        let mut items = Vec::with_capacity(markers.len());
        for marker in &markers {
            items.push(Arc::new(Entity::build(marker, defaults, registry)?));
        }
        Ok(Entities { items })
    }

    /// Wrap pre-built entities, preserving order.
    pub fn from_vec(items: Vec<Arc<Entity>>) -> Entities {
        Entities { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.items.iter()
    }

    /// Order-sensitive 64-bit hash over the members' raw attributes.
    /// Adding, removing or reordering members changes it; re-parsing the
    /// same bytes reproduces it.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for entity in &self.items {
            hasher.write(entity.raw_attributes());
        }
        hasher.finish()
    }

    /// Whether any member requests coalescing.
    pub fn has_coalesce(&self) -> bool {
        self.items.iter().any(|e| e.config().coalesce)
    }

    /// Split into (coalescing, direct) subsets, preserving order. Members
    /// are shared, not cloned.
    pub fn split_coalesce(&self) -> (Entities, Entities) {
        let (coalesce, direct): (Vec<_>, Vec<_>) = self
            .items
            .iter()
            .cloned()
            .partition(|e| e.config().coalesce);
        (Entities { items: coalesce }, Entities { items: direct })
    }
}
