//! HTTP(S) backend handler

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::error::{EsiError, Result};
use crate::resource::{ResourceArgs, ResourceHandler};

/// Build the shared HTTP client: pooled connections, no total-request
/// timeout of its own (each fetch carries the entity deadline).
pub fn build_client() -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .http2_adaptive_window(true)
        .build()
        .map_err(|e| EsiError::Fatal(format!("cannot build HTTP client: {}", e)))
}

/// Handler for `http://` and `https://` resources.
pub struct HttpHandler {
    client: Client,
}

impl HttpHandler {
    /// A handler with its own connection pool.
    pub fn new() -> Result<Self> {
        Ok(HttpHandler {
            client: build_client()?,
        })
    }

    /// A handler sharing an existing client, the way the default factory
    /// wires all HTTP resources onto one pool.
    pub fn with_client(client: Client) -> Self {
        HttpHandler { client }
    }
}

#[async_trait]
impl ResourceHandler for HttpHandler {
    async fn do_request(&self, args: &ResourceArgs) -> Result<(Option<HeaderMap>, Bytes)> {
        args.validate()?;

        let forward_body =
            args.tag.forward_post_data && args.request.method == Method::POST;
        let mut request = if forward_body {
            self.client.post(args.url.as_str())
        } else {
            self.client.get(args.url.as_str())
        };
        request = request.timeout(args.tag.timeout);

        for (name, value) in args.prepare_forward_headers() {
            let Ok(name) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(&value) else {
                continue;
            };
            request = request.header(name, value);
        }
        if forward_body {
            if let Some(body) = &args.request.body {
                request = request.body(body.clone());
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EsiError::Timeout(format!("URL {:?}: {}", args.url, e))
            } else {
                EsiError::Temporary(format!("URL {:?}: {}", args.url, e))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(EsiError::NotFound(format!("URL {:?}: 404", args.url)));
        }
        if !status.is_success() {
            return Err(EsiError::Temporary(format!(
                "URL {:?}: unexpected status {}",
                args.url, status
            )));
        }

        let headers = response.headers().clone();

        // Read at most max_body_size bytes; anything beyond is dropped.
        let limit = args.tag.max_body_size as usize;
        let mut body = BytesMut::with_capacity(limit.min(16 * 1024));
        let mut response = response;
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                EsiError::Timeout(format!("URL {:?}: {}", args.url, e))
            } else {
                EsiError::Temporary(format!("URL {:?}: body read: {}", args.url, e))
            }
        })? {
            let remaining = limit - body.len();
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                debug!(url = %args.url, limit, "backend response truncated");
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok((Some(headers), body.freeze()))
    }

    async fn close(&self) -> Result<()> {
        // Connection pools close with the client drop.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{RequestSnapshot, TagArgs};

    fn args(url: &str) -> ResourceArgs {
        ResourceArgs {
            request: RequestSnapshot::get("http://outer.example/page"),
            url: url.to_string(),
            tag: TagArgs {
                timeout: Duration::from_millis(250),
                max_body_size: 1024,
                ..TagArgs::default()
            },
        }
    }

    #[tokio::test]
    async fn test_invalid_args_rejected_before_network() {
        let handler = HttpHandler::new().unwrap();
        let mut bad = args("http://localhost:1/");
        bad.tag.timeout = Duration::ZERO;
        let err = handler.do_request(&bad).await.unwrap_err();
        assert!(err.is_empty(), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let handler = HttpHandler::new().unwrap();
        // Nothing listens on a reserved port of the loopback interface.
        let err = handler
            .do_request(&args("http://127.0.0.1:9/esi/fragment"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let handler = HttpHandler::new().unwrap();
        assert!(handler.close().await.is_ok());
        assert!(handler.close().await.is_ok());
    }
}
