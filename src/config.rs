//! Configuration for the ESI middleware
//!
//! The host hands over one YAML document with a list of path scopes. Each
//! scope carries the per-tag defaults, the method gate, cache bindings,
//! resource alias bindings and the log destination.
//!
//! ```yaml
//! paths:
//!   - path: /
//!     timeout: 10s
//!     ttl: 0s
//!     max_body_size: 5MB
//!     on_error: "backend temporarily unavailable"
//!     allowed_methods: [GET, POST]
//!     cmd_header_name: X-Esi-Cmd
//!     log_file: stderr
//!     log_level: info
//!     cache_urls:
//!       - memory
//!     resources:
//!       - alias: redisAWS1
//!         url: redis://localhost:6379?db=0&lazy=1
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::entity::{TagDefaults, DEFAULT_MAX_BODY_SIZE, DEFAULT_ON_ERROR, DEFAULT_TIMEOUT};
use crate::error::{EsiError, Result};
use crate::util;

/// One alias → URL binding for a backend resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceBinding {
    /// Name tags use to reference the resource (`src="redisAWS1"` or
    /// `src="redisAWS1://..."`)
    pub alias: String,
    /// Backend URL handed to the scheme factory
    pub url: String,
}

/// Configuration of one path scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Path prefix this scope applies to (default `/`)
    #[serde(default = "default_path")]
    pub path: String,

    /// Default entity fetch budget, e.g. `20s` (tags may override)
    #[serde(default = "default_timeout")]
    pub timeout: String,

    /// Default result-cache TTL; `0s` disables caching
    #[serde(default = "default_ttl")]
    pub ttl: String,

    /// Default payload truncation limit, e.g. `5MB`
    #[serde(default = "default_max_body_size")]
    pub max_body_size: String,

    /// Default failure payload: literal text, or a `*.html` file to load
    #[serde(default)]
    pub on_error: String,

    /// Methods the middleware processes; anything else passes through
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,

    /// Header that carries middleware commands (`purge`)
    #[serde(default = "default_cmd_header_name")]
    pub cmd_header_name: String,

    /// Log destination: `stderr`, `stdout`, a file path, or empty for
    /// logging disabled
    #[serde(default)]
    pub log_file: String,

    /// Log level: `debug`, `info` or `fatal`; empty disables logging
    #[serde(default)]
    pub log_level: String,

    /// Result caches for this scope, e.g. `memory` or `redis://host/1`
    #[serde(default)]
    pub cache_urls: Vec<String>,

    /// Alias bindings created at startup
    #[serde(default)]
    pub resources: Vec<ResourceBinding>,
}

impl Default for PathConfig {
    fn default() -> Self {
        PathConfig {
            path: default_path(),
            timeout: default_timeout(),
            ttl: default_ttl(),
            max_body_size: default_max_body_size(),
            on_error: String::new(),
            allowed_methods: default_allowed_methods(),
            cmd_header_name: default_cmd_header_name(),
            log_file: String::new(),
            log_level: String::new(),
            cache_urls: Vec::new(),
            resources: Vec::new(),
        }
    }
}

impl PathConfig {
    /// Validate the scope and parse its typed values.
    pub fn validate(&self) -> Result<()> {
        self.tag_defaults()?;
        if self.path.is_empty() || !self.path.starts_with('/') {
            return Err(EsiError::NotValid(format!(
                "path scope {:?} must start with '/'",
                self.path
            )));
        }
        if self.allowed_methods.is_empty() {
            return Err(EsiError::Empty(format!(
                "path scope {:?} allows no methods",
                self.path
            )));
        }
        match self.log_level.as_str() {
            "" | "debug" | "info" | "fatal" => {}
            other => {
                return Err(EsiError::NotValid(format!(
                    "unknown log level {:?} in path scope {:?}",
                    other, self.path
                )))
            }
        }
        Ok(())
    }

    /// The per-tag defaults of this scope, parsed. Missing values fall
    /// back to the crate defaults; an `on_error` ending in `.html` must
    /// name a readable file or configuration load fails.
    pub fn tag_defaults(&self) -> Result<TagDefaults> {
        let timeout = match self.timeout.as_str() {
            "" => DEFAULT_TIMEOUT,
            v => util::parse_duration(v)?,
        };
        let ttl = match self.ttl.as_str() {
            "" => Duration::ZERO,
            v => util::parse_duration(v)?,
        };
        let max_body_size = match self.max_body_size.as_str() {
            "" => DEFAULT_MAX_BODY_SIZE,
            v => util::parse_bytes(v)?,
        };
        let on_error = match self.on_error.as_str() {
            "" => Bytes::from_static(DEFAULT_ON_ERROR.as_bytes()),
            v => crate::entity::load_on_error_value(v)?,
        };
        if timeout == Duration::ZERO {
            return Err(EsiError::NotValid(format!(
                "path scope {:?} timeout must be positive",
                self.path
            )));
        }
        if max_body_size == 0 {
            return Err(EsiError::NotValid(format!(
                "path scope {:?} max_body_size must be positive",
                self.path
            )));
        }
        Ok(TagDefaults {
            timeout,
            ttl,
            max_body_size,
            on_error,
        })
    }

    /// Whether the middleware processes requests with this method.
    pub fn is_method_allowed(&self, method: &http::Method) -> bool {
        self.allowed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Whether this scope covers the request path.
    pub fn matches_path(&self, path: &str) -> bool {
        path.starts_with(&self.path)
    }
}

/// The whole middleware configuration: an ordered list of path scopes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EsiConfig {
    #[serde(default)]
    pub paths: Vec<PathConfig>,
}

impl EsiConfig {
    /// One all-covering scope with crate defaults.
    pub fn single_scope() -> Self {
        EsiConfig {
            paths: vec![PathConfig::default()],
        }
    }

    /// Load and validate a YAML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            EsiError::Fatal(format!(
                "cannot read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let config: EsiConfig = serde_yaml::from_str(&content).map_err(|e| {
            EsiError::NotValid(format!(
                "cannot parse config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every scope.
    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(EsiError::Empty("configuration has no path scopes".into()));
        }
        for path in &self.paths {
            path.validate()?;
        }
        Ok(())
    }
}

fn default_path() -> String {
    "/".to_string()
}

fn default_timeout() -> String {
    "20s".to_string()
}

fn default_ttl() -> String {
    "0s".to_string()
}

fn default_max_body_size() -> String {
    "5MB".to_string()
}

fn default_allowed_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

fn default_cmd_header_name() -> String {
    "X-Esi-Cmd".to_string()
}
