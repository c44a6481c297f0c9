//! rivet-testkit: shared processors and helpers for tests.
//!
//! Keeps the integration tests honest: the same processor implementations
//! are exercised by every scenario instead of one-off closures per test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rivet_core::{AsyncContext, ProcessorError, RequestBody, UserProcessor};

/// Class name served by [`EchoProcessor`].
pub const ECHO_CLASS: &str = "Ping";
/// Class name served by [`CounterProcessor`].
pub const COUNTER_CLASS: &str = "Count";
/// Class name served by [`SleepProcessor`].
pub const SLEEP_CLASS: &str = "Sleepy";

/// Answers `"ok:" + request` for class `Ping`.
pub struct EchoProcessor;

#[async_trait]
impl UserProcessor for EchoProcessor {
    fn interest(&self) -> Vec<String> {
        vec![ECHO_CLASS.to_string()]
    }

    async fn handle_request(
        &self,
        ctx: AsyncContext,
        request: RequestBody,
    ) -> Result<(), ProcessorError> {
        let msg: String = request.decode()?;
        ctx.send_response(&format!("ok:{msg}"))
            .map_err(|e| ProcessorError::server_error(e.to_string()))
    }
}

/// Counts receipts for class `Count`; never responds on oneway traffic.
pub struct CounterProcessor {
    hits: Arc<AtomicU64>,
}

impl CounterProcessor {
    pub fn new() -> Self {
        Self {
            hits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared hit counter; clone before handing the processor away.
    pub fn hits(&self) -> Arc<AtomicU64> {
        self.hits.clone()
    }
}

impl Default for CounterProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserProcessor for CounterProcessor {
    fn interest(&self) -> Vec<String> {
        vec![COUNTER_CLASS.to_string()]
    }

    async fn handle_request(
        &self,
        ctx: AsyncContext,
        _request: RequestBody,
    ) -> Result<(), ProcessorError> {
        let count = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
        if !ctx.is_oneway() {
            ctx.send_response(&count)
                .map_err(|e| ProcessorError::server_error(e.to_string()))?;
        }
        Ok(())
    }
}

/// Sleeps before answering; for timeout scenarios.
pub struct SleepProcessor {
    pub delay: Duration,
}

#[async_trait]
impl UserProcessor for SleepProcessor {
    fn interest(&self) -> Vec<String> {
        vec![SLEEP_CLASS.to_string()]
    }

    async fn handle_request(
        &self,
        ctx: AsyncContext,
        _request: RequestBody,
    ) -> Result<(), ProcessorError> {
        tokio::time::sleep(self.delay).await;
        ctx.send_response("done")
            .map_err(|e| ProcessorError::server_error(e.to_string()))
    }
}

/// Install a fmt subscriber honoring `RUST_LOG`; repeat calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
