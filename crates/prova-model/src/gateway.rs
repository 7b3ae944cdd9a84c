// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retry-wrapped, rate-limited, cache-aware facade over a [`ModelApi`].
//!
//! The gateway owns model-side concurrency: callers never talk to a provider
//! directly.  Every call acquires a connection permit, runs the provider with
//! retry on transient failures, accounts token usage, and reports how much of
//! the elapsed time was spent waiting (connection queue + retry sleeps) so
//! the caller can subtract it from working time.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{
    cache::GenerateCache,
    error::ModelError,
    provider::{qualified_name, ModelApi},
    types::{ChatMessage, GenerateConfig, ModelOutput, ModelUsage, ToolChoice, ToolInfo},
};

/// Floor under jittered retry sleeps so a run of near-zero jitter draws never
/// turns backoff into a hot loop.
const MIN_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Connection permits shared across gateways.
///
/// Keyed by [`ModelApi::connection_key`], so two gateways wrapping the same
/// provider/account contend on the same pool while different accounts do not.
#[derive(Default)]
pub struct ConnectionPool {
    inner: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn checkout(&self, key: &str, permits: usize) -> Arc<Semaphore> {
        let mut map = self.inner.lock().unwrap();
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(permits.max(1)))),
        )
    }
}

#[derive(Clone)]
pub struct GatewayOptions {
    /// Override the provider's connection limit.
    pub max_connections: Option<usize>,
    /// Default per-call timeout (retries included) when the generate config
    /// does not set one.
    pub timeout: Option<Duration>,
    /// First retry delay.  Production default 3 s; tests shrink it.
    pub retry_base: Duration,
    /// Ceiling for the exponential delay before jitter.
    pub retry_cap: Duration,
    pub cache: Option<Arc<GenerateCache>>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            max_connections: None,
            timeout: None,
            retry_base: Duration::from_secs(3),
            retry_cap: Duration::from_secs(30),
            cache: None,
        }
    }
}

/// One completed gateway call, with the timing split the limit tracker needs.
#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub output: ModelOutput,
    /// Total wall clock for the call.
    pub total: Duration,
    /// Portion of `total` spent in the connection queue or retry sleeps.
    pub waited: Duration,
    pub cache_hit: bool,
    pub retries: u32,
}

pub struct ModelGateway {
    api: Arc<dyn ModelApi>,
    options: GatewayOptions,
    pool: Arc<ConnectionPool>,
    usage: Mutex<BTreeMap<String, ModelUsage>>,
}

impl ModelGateway {
    pub fn new(api: Arc<dyn ModelApi>, options: GatewayOptions) -> Self {
        Self::with_pool(api, options, Arc::new(ConnectionPool::new()))
    }

    /// Gateway sharing a connection pool with others (multi-task evals).
    pub fn with_pool(
        api: Arc<dyn ModelApi>,
        options: GatewayOptions,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self { api, options, pool, usage: Mutex::new(BTreeMap::new()) }
    }

    pub fn model(&self) -> &Arc<dyn ModelApi> {
        &self.api
    }

    pub fn qualified_name(&self) -> String {
        qualified_name(self.api.as_ref())
    }

    /// Snapshot of accumulated token usage per model.
    pub fn usage(&self) -> BTreeMap<String, ModelUsage> {
        self.usage.lock().unwrap().clone()
    }

    pub async fn generate(
        &self,
        input: &[ChatMessage],
        tools: &[ToolInfo],
        tool_choice: &ToolChoice,
        config: &GenerateConfig,
        epoch: Option<usize>,
    ) -> Result<GatewayReply, ModelError> {
        let started = Instant::now();
        let name = self.qualified_name();

        // Cache lookup happens before any connection is taken: a hit must not
        // contend with live traffic.
        let fingerprint = self.options.cache.as_ref().map(|c| {
            c.fingerprint(&name, input, tools, tool_choice, config, epoch)
        });
        if let (Some(cache), Some(fp)) = (&self.options.cache, &fingerprint) {
            if let Some(mut output) = cache.get(fp) {
                debug!(model = %name, "generate cache hit");
                // Hits report zero usage: no tokens were spent, so none are
                // accounted or charged against token limits.
                output.usage = ModelUsage::default();
                let total = started.elapsed();
                output.time = Some(total.as_secs_f64());
                output.working_time = Some(total.as_secs_f64());
                return Ok(GatewayReply {
                    output,
                    total,
                    waited: Duration::ZERO,
                    cache_hit: true,
                    retries: 0,
                });
            }
        }

        let permits = self
            .options
            .max_connections
            .unwrap_or_else(|| self.api.max_connections());
        let semaphore = self.pool.checkout(&self.api.connection_key(), permits);
        let queue_start = Instant::now();
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| ModelError::Cancelled)?;
        let mut waited = queue_start.elapsed();

        let timeout = config.timeout().or(self.options.timeout);
        let deadline = timeout.map(|t| started + t);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let call = self.api.generate(input, tools, tool_choice, config);
            let result = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ModelError::Timeout(timeout.unwrap_or_default()));
                    }
                    match tokio::time::timeout(remaining, call).await {
                        Ok(r) => r,
                        Err(_) => {
                            return Err(ModelError::Timeout(timeout.unwrap_or_default()))
                        }
                    }
                }
                None => call.await,
            };

            match result {
                Ok(mut output) => {
                    self.record_usage(&name, &output.usage);
                    let total = started.elapsed();
                    output.time = Some(total.as_secs_f64());
                    output.working_time =
                        Some(total.saturating_sub(waited).as_secs_f64());
                    if output.model.is_empty() {
                        output.model = self.api.model_name().to_string();
                    }
                    if let (Some(cache), Some(fp)) = (&self.options.cache, &fingerprint) {
                        cache.put(fp, &name, &output);
                    }
                    return Ok(GatewayReply {
                        output,
                        total,
                        waited,
                        cache_hit: false,
                        retries: attempt - 1,
                    });
                }
                Err(err) => {
                    if !self.is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.backoff_delay(attempt);
                    if let Some(d) = deadline {
                        if Instant::now() + delay >= d {
                            warn!(model = %name, attempt, error = %err,
                                "retry budget exhausted");
                            return Err(err);
                        }
                    }
                    debug!(model = %name, attempt, delay_ms = delay.as_millis() as u64,
                        error = %err, "transient model error; backing off");
                    tokio::time::sleep(delay).await;
                    waited += delay;
                }
            }
        }
    }

    fn is_retryable(&self, err: &ModelError) -> bool {
        if self.api.is_retryable(err) {
            return true;
        }
        matches!(err, ModelError::Transient { status: Some(s), .. }
            if ModelError::status_is_transient(*s))
    }

    /// Full-jitter exponential backoff: the exponential delay (base doubling
    /// up to the cap) scaled by a uniform fraction.  The fraction is derived
    /// from a hash of call-local entropy rather than a thread RNG so the
    /// crate carries no RNG dependency.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .options
            .retry_base
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(self.options.retry_cap);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let mut hasher = Sha256::new();
        hasher.update(self.api.connection_key().as_bytes());
        hasher.update(attempt.to_le_bytes());
        hasher.update(nanos.to_le_bytes());
        let digest = hasher.finalize();
        let word = u64::from_le_bytes(digest[..8].try_into().unwrap());
        let frac = word as f64 / u64::MAX as f64;
        exp.mul_f64(frac).max(MIN_RETRY_SLEEP)
    }

    fn record_usage(&self, name: &str, usage: &ModelUsage) {
        self.usage
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .add(usage);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
