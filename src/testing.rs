//! Test support: deterministic mock resource handlers and small fixtures.
//!
//! Lives in the library (not behind `cfg(test)`) so integration tests and
//! downstream hosts can drive the pipeline without real backends.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

use crate::error::{EsiError, Result};
use crate::registry::ResourceRegistry;
use crate::resource::{ResourceArgs, ResourceHandler};
use crate::util;

/// Serializes tests that mutate process-wide tunables (circuit-breaker
/// thresholds). Poisoning is ignored: a failed test must not wedge the
/// rest of the suite.
pub fn tuning_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Handler answering every request with fixed bytes.
pub struct MockContent {
    content: Bytes,
}

impl MockContent {
    pub fn new(content: impl Into<String>) -> Self {
        MockContent {
            content: Bytes::from(content.into()),
        }
    }
}

#[async_trait]
impl ResourceHandler for MockContent {
    async fn do_request(&self, _args: &ResourceArgs) -> Result<(Option<HeaderMap>, Bytes)> {
        Ok((None, self.content.clone()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Handler echoing its content plus the request details, so a test can
/// assert which resource answered and with what configuration:
/// `Content "scheme://host" Timeout 2s MaxBody 3.0 kB`.
pub struct MockContentEcho {
    content: String,
}

impl MockContentEcho {
    pub fn new(content: impl Into<String>) -> Self {
        MockContentEcho {
            content: content.into(),
        }
    }
}

#[async_trait]
impl ResourceHandler for MockContentEcho {
    async fn do_request(&self, args: &ResourceArgs) -> Result<(Option<HeaderMap>, Bytes)> {
        let text = format!(
            "{} {:?} Timeout {} MaxBody {}",
            self.content,
            args.url,
            util::format_duration(args.tag.timeout),
            util::format_bytes(args.tag.max_body_size),
        );
        Ok((None, Bytes::from(text)))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Handler failing requests and/or closes with configured errors.
#[derive(Default)]
pub struct MockError {
    request_err: Option<EsiError>,
    close_err: Option<EsiError>,
}

impl MockError {
    /// Every `do_request` fails with the given error.
    pub fn requesting(err: EsiError) -> Self {
        MockError {
            request_err: Some(err),
            close_err: None,
        }
    }

    /// `close` fails with the given error; requests succeed empty.
    pub fn closing(err: EsiError) -> Self {
        MockError {
            request_err: None,
            close_err: Some(err),
        }
    }
}

#[async_trait]
impl ResourceHandler for MockError {
    async fn do_request(&self, _args: &ResourceArgs) -> Result<(Option<HeaderMap>, Bytes)> {
        match &self.request_err {
            Some(e) => Err(e.clone()),
            None => Ok((None, Bytes::new())),
        }
    }

    async fn close(&self) -> Result<()> {
        match &self.close_err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Handler alternating failure and success: the first call fails with
/// `Timeout`, the second succeeds, and so on.
pub struct MockSwitching {
    content: Bytes,
    calls: AtomicUsize,
}

impl MockSwitching {
    pub fn new(content: impl Into<String>) -> Self {
        MockSwitching {
            content: Bytes::from(content.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Total `do_request` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceHandler for MockSwitching {
    async fn do_request(&self, _args: &ResourceArgs) -> Result<(Option<HeaderMap>, Bytes)> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n % 2 == 0 {
            Ok((None, self.content.clone()))
        } else {
            Err(EsiError::Timeout("mock backend timed out".into()))
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Handler sleeping before it answers; for cancellation and coalescing
/// tests.
pub struct MockSlow {
    content: Bytes,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockSlow {
    pub fn new(content: impl Into<String>, delay: Duration) -> Self {
        MockSlow {
            content: Bytes::from(content.into()),
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total `do_request` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceHandler for MockSlow {
    async fn do_request(&self, _args: &ResourceArgs) -> Result<(Option<HeaderMap>, Bytes)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok((None, self.content.clone()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Handler counting invocations; for parse-once and fan-out assertions.
pub struct MockCounting {
    content: Bytes,
    calls: Arc<AtomicUsize>,
}

impl MockCounting {
    pub fn new(content: impl Into<String>) -> Self {
        MockCounting {
            content: Bytes::from(content.into()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceHandler for MockCounting {
    async fn do_request(&self, _args: &ResourceArgs) -> Result<(Option<HeaderMap>, Bytes)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((None, self.content.clone()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A registry with `MockContent` handlers bound to the given aliases.
pub fn registry_with(aliases: &[&str]) -> ResourceRegistry {
    let registry = ResourceRegistry::new();
    for alias in aliases {
        registry.register_handler(alias, Arc::new(MockContent::new("Any content")));
    }
    registry
}

/// Removes its file when dropped.
pub struct TempFileGuard {
    path: PathBuf,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Write `content` to a unique temporary `.html` file and return its path
/// with a guard that removes it on drop.
pub fn temp_html_file(content: &str) -> (PathBuf, TempFileGuard) {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let path = std::env::temp_dir().join(format!(
        "esi-stitch-{}-{}.html",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst),
    ));
    std::fs::write(&path, content).expect("temp file write");
    (path.clone(), TempFileGuard { path })
}
