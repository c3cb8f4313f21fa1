//! Redis backend handler and cache
//!
//! The handler serves `redis://` resources: the entity's rendered `key`
//! is fetched with a plain GET and a missing key maps to `NotFound`.
//! Understood URL query parameters: `db` (database index), `lazy=1` (skip
//! the first-use PING probe) and `cancellable=1` (bound the GET by the
//! entity timeout inside the driver as well). Pool sizing parameters of
//! other drivers are accepted and ignored; the multiplexed connection
//! manager replaces a pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{EsiError, Result};
use crate::esicache::Cacher;
use crate::resource::{ResourceArgs, ResourceHandler, ResourceOptions};

struct RedisConnector {
    url: String,
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    ping_on_connect: bool,
}

impl std::fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnector")
            .field("url", &self.url)
            .field("ping_on_connect", &self.ping_on_connect)
            .finish_non_exhaustive()
    }
}

impl RedisConnector {
    fn new(raw_url: &str, ping_default: bool) -> Result<(Self, HashMap<String, String>)> {
        let (base, params) = split_query(raw_url);

        let mut connect_url = base.to_string();
        if let Some(db) = params.get("db") {
            if !db.is_empty() && !has_db_path(&connect_url) {
                if !connect_url.ends_with('/') {
                    connect_url.push('/');
                }
                connect_url.push_str(db);
            }
        }

        let client = redis::Client::open(connect_url.as_str()).map_err(|e| {
            EsiError::NotValid(format!("cannot parse redis URL {:?}: {}", raw_url, e))
        })?;

        let lazy = params.get("lazy").map(|v| v == "1").unwrap_or(false);
        Ok((
            RedisConnector {
                url: raw_url.to_string(),
                client,
                conn: OnceCell::new(),
                ping_on_connect: ping_default && !lazy,
            },
            params,
        ))
    }

    /// The shared multiplexed connection, established on first use.
    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = self
                    .client
                    .get_connection_manager()
                    .await
                    .map_err(|e| map_redis_error(&self.url, e))?;
                if self.ping_on_connect {
                    let mut probe = conn.clone();
                    let pong: String = redis::cmd("PING")
                        .query_async(&mut probe)
                        .await
                        .map_err(|e| EsiError::Fatal(format!("redis PING {:?}: {}", self.url, e)))?;
                    if pong != "PONG" {
                        return Err(EsiError::Fatal(format!(
                            "redis PING {:?} answered {:?}",
                            self.url, pong
                        )));
                    }
                }
                Ok(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

fn split_query(url: &str) -> (&str, HashMap<String, String>) {
    let Some((base, query)) = url.split_once('?') else {
        return (url, HashMap::new());
    };
    let params = query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect();
    (base, params)
}

/// Whether a redis URL already selects a database via its path.
fn has_db_path(url: &str) -> bool {
    url.split_once("://")
        .map(|(_, rest)| rest.contains('/') && !rest.ends_with('/'))
        .unwrap_or(false)
}

fn map_redis_error(url: &str, e: redis::RedisError) -> EsiError {
    if e.is_timeout() {
        EsiError::Timeout(format!("redis {:?}: {}", url, e))
    } else if e.is_connection_dropped() {
        EsiError::AlreadyClosed(format!("redis {:?}: {}", url, e))
    } else {
        EsiError::Temporary(format!("redis {:?}: {}", url, e))
    }
}

/// Handler for `redis://` resources: GET by the entity's rendered key.
#[derive(Debug)]
pub struct RedisHandler {
    connector: RedisConnector,
    cancellable: bool,
    closed: AtomicBool,
}

impl RedisHandler {
    /// Build from factory options. The connection is established on first
    /// use; `lazy=1` additionally skips the PING probe issued then.
    pub fn new(opts: &ResourceOptions) -> Result<Self> {
        let (connector, params) = RedisConnector::new(&opts.url, true)?;
        Ok(RedisHandler {
            connector,
            cancellable: params.get("cancellable").map(|v| v == "1").unwrap_or(false),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ResourceHandler for RedisHandler {
    async fn do_request(&self, args: &ResourceArgs) -> Result<(Option<HeaderMap>, Bytes)> {
        args.validate_with_key()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(EsiError::AlreadyClosed(format!(
                "redis {:?} has been shut down",
                self.connector.url
            )));
        }
        let key = args.tag.key.as_deref().unwrap_or_default();

        let mut conn = self.connector.connection().await?;
        let lookup = async {
            conn.get::<_, Option<Vec<u8>>>(key)
                .await
                .map_err(|e| map_redis_error(&self.connector.url, e))
        };

        let value = if self.cancellable {
            match tokio::time::timeout(args.tag.timeout, lookup).await {
                Ok(value) => value?,
                Err(_) => {
                    return Err(EsiError::Timeout(format!(
                        "redis {:?}: GET {:?} exceeded {:?}",
                        self.connector.url, key, args.tag.timeout
                    )))
                }
            }
        } else {
            lookup.await?
        };

        let Some(mut value) = value else {
            return Err(EsiError::NotFound(format!(
                "redis {:?}: key {:?} not found",
                self.connector.url, key
            )));
        };

        let limit = args.tag.max_body_size as usize;
        if value.len() > limit {
            debug!(url = %self.connector.url, key, limit, "redis value truncated");
            value.truncate(limit);
        }
        Ok((None, Bytes::from(value)))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A [`Cacher`] over the same connection machinery, for `cache redis://...`
/// configuration lines.
pub struct RedisCache {
    connector: RedisConnector,
}

impl RedisCache {
    pub fn new(url: &str) -> Result<Self> {
        // A cache probe failing at startup is the host's concern, not a
        // request's; never PING here.
        let (connector, _) = RedisConnector::new(url, false)?;
        Ok(RedisCache { connector })
    }
}

#[async_trait]
impl Cacher for RedisCache {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.connector.connection().await?;
        conn.set_ex::<_, _, ()>(key, value.as_ref(), ttl.as_secs().max(1))
            .await
            .map_err(|e| map_redis_error(&self.connector.url, e))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connector.connection().await?;
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| map_redis_error(&self.connector.url, e))?;
        Ok(value.map(Bytes::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_query() {
        let (base, params) = split_query("redis://localhost:6379?db=2&lazy=1&max_active=10");
        assert_eq!(base, "redis://localhost:6379");
        assert_eq!(params.get("db").unwrap(), "2");
        assert_eq!(params.get("lazy").unwrap(), "1");
        // pool parameters are carried along but unused
        assert_eq!(params.get("max_active").unwrap(), "10");

        let (base, params) = split_query("redis://localhost:6379/0");
        assert_eq!(base, "redis://localhost:6379/0");
        assert!(params.is_empty());
    }

    #[test]
    fn test_has_db_path() {
        assert!(has_db_path("redis://localhost:6379/0"));
        assert!(!has_db_path("redis://localhost:6379"));
        assert!(!has_db_path("redis://localhost:6379/"));
    }

    #[test]
    fn test_new_handler_parses_url() {
        let opts = ResourceOptions::new("redis://localhost:6379?db=1&lazy=1", "kv");
        assert!(RedisHandler::new(&opts).is_ok());
    }

    #[test]
    fn test_new_handler_rejects_bad_url() {
        let opts = ResourceOptions::new("redis://:@[/", "kv");
        match RedisHandler::new(&opts) {
            Err(e) => assert!(e.is_not_valid()),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn test_closed_handler_reports_already_closed() {
        let opts = ResourceOptions::new("redis://localhost:6379?lazy=1", "kv");
        let handler = RedisHandler::new(&opts).unwrap();
        handler.close().await.unwrap();

        let args = ResourceArgs {
            request: crate::resource::RequestSnapshot::get("http://outer/"),
            url: "redis://localhost:6379".into(),
            tag: crate::resource::TagArgs {
                timeout: Duration::from_millis(50),
                max_body_size: 100,
                key: Some("k".into()),
                ..crate::resource::TagArgs::default()
            },
        };
        let err = handler.do_request(&args).await.unwrap_err();
        assert!(matches!(err, EsiError::AlreadyClosed(_)), "{err}");
    }
}
