//! Pooled outbound HTTP clients per downstream service category.
//!
//! One lazily-built `reqwest::Client` per category, each with its own
//! connection limits, timeouts, and retry policy. Requests retry with
//! exponential backoff on transient failures only; per-pool statistics
//! feed the quality monitor. A client whose transport breaks is dropped
//! and transparently rebuilt on next use.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::schema::{PoolConfig, PoolsConfig};
use crate::errors::{classify_http_error, DownstreamError};

// ---------------------------------------------------------------------------
// Service categories
// ---------------------------------------------------------------------------

/// Downstream service category, one pool each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Stt,
    Llm,
    Tts,
    External,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Stt => "stt",
            ServiceKind::Llm => "llm",
            ServiceKind::Tts => "tts",
            ServiceKind::External => "external",
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Usage counters for one pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency: Duration,
}

impl PoolStats {
    pub fn mean_latency(&self) -> Duration {
        if self.successes == 0 {
            return Duration::ZERO;
        }
        self.total_latency / self.successes as u32
    }

    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            return 1.0;
        }
        self.successes as f64 / self.requests as f64
    }
}

// ---------------------------------------------------------------------------
// ConnectionPoolManager
// ---------------------------------------------------------------------------

pub struct ConnectionPoolManager {
    configs: Mutex<HashMap<ServiceKind, PoolConfig>>,
    clients: Mutex<HashMap<ServiceKind, reqwest::Client>>,
    stats: Mutex<HashMap<ServiceKind, PoolStats>>,
    realtime_optimized: Mutex<bool>,
}

impl ConnectionPoolManager {
    pub fn new(pools: &PoolsConfig) -> Self {
        let mut configs = HashMap::new();
        configs.insert(ServiceKind::Stt, pools.stt);
        configs.insert(ServiceKind::Llm, pools.llm);
        configs.insert(ServiceKind::Tts, pools.tts);
        configs.insert(ServiceKind::External, pools.external);
        Self {
            configs: Mutex::new(configs),
            clients: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            realtime_optimized: Mutex::new(false),
        }
    }

    pub fn config(&self, kind: ServiceKind) -> PoolConfig {
        *self.configs.lock().unwrap().get(&kind).expect("all kinds configured")
    }

    /// Get the pooled client for a category, building it on first use.
    pub fn client(&self, kind: ServiceKind) -> reqwest::Client {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&kind) {
            return client.clone();
        }
        let config = self.config(kind);
        let client = build_client(&config);
        debug!(
            "created {} pool ({} max connections)",
            kind.as_str(),
            config.max_connections
        );
        clients.insert(kind, client.clone());
        client
    }

    /// Drop a pool's client so the next request rebuilds the transport.
    pub fn invalidate(&self, kind: ServiceKind) {
        if self.clients.lock().unwrap().remove(&kind).is_some() {
            warn!("{} pool invalidated, will rebuild on next use", kind.as_str());
        }
    }

    /// Number of pools built so far (lazily created).
    pub fn built_pool_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn stats(&self, kind: ServiceKind) -> PoolStats {
        self.stats.lock().unwrap().get(&kind).cloned().unwrap_or_default()
    }

    fn record(&self, kind: ServiceKind, latency: Duration, success: bool) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(kind).or_default();
        entry.requests += 1;
        if success {
            entry.successes += 1;
            entry.total_latency += latency;
        } else {
            entry.failures += 1;
        }
    }

    /// POST a JSON body and parse a JSON response, with bounded retries.
    ///
    /// Only transient failures retry; a broken transport additionally
    /// invalidates the pool so the client is rebuilt.
    pub async fn post_json(
        &self,
        kind: ServiceKind,
        url: &str,
        body: &Value,
    ) -> Result<Value, DownstreamError> {
        self.execute(kind, || async {
            let client = self.client(kind);
            let response = client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(classify_http_error)?;
            Self::parse_json(response).await
        })
        .await
    }

    /// GET a URL and parse a JSON response, with bounded retries.
    pub async fn get_json(
        &self,
        kind: ServiceKind,
        url: &str,
    ) -> Result<Value, DownstreamError> {
        self.execute(kind, || async {
            let client = self.client(kind);
            let response = client.get(url).send().await.map_err(classify_http_error)?;
            Self::parse_json(response).await
        })
        .await
    }

    async fn execute<F, Fut>(&self, kind: ServiceKind, op: F) -> Result<Value, DownstreamError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Value, DownstreamError>>,
    {
        let config = self.config(kind);
        let backoff = ExponentialBuilder::new()
            .with_min_delay(Duration::from_millis(config.retry_min_delay_ms))
            .with_factor(2.0)
            .with_jitter()
            .with_max_times(config.retry_attempts);

        let start = Instant::now();
        let result = op
            .retry(backoff)
            .when(|e: &DownstreamError| e.is_transient())
            .notify(|e, dur| {
                warn!("{} request failed ({}), retrying in {:?}", kind.as_str(), e, dur);
            })
            .await;

        let latency = start.elapsed();
        match &result {
            Ok(_) => self.record(kind, latency, true),
            Err(e) => {
                self.record(kind, latency, false);
                if e.breaks_transport() {
                    self.invalidate(kind);
                }
            }
        }
        result
    }

    async fn parse_json(response: reqwest::Response) -> Result<Value, DownstreamError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DownstreamError::Http {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| DownstreamError::InvalidResponse(e.to_string()))
    }

    /// Trade resilience for latency under interactive load: tighter connect
    /// timeouts, more LLM concurrency, fewer retries.
    ///
    /// Called at every session start; applied once.
    pub fn optimize_for_realtime(&self) {
        {
            let mut optimized = self.realtime_optimized.lock().unwrap();
            if *optimized {
                return;
            }
            *optimized = true;
        }
        {
            let mut configs = self.configs.lock().unwrap();
            if let Some(llm) = configs.get_mut(&ServiceKind::Llm) {
                llm.max_connections = 20;
                llm.keepalive_timeout_secs = 120;
                llm.retry_attempts = 1;
            }
            if let Some(stt) = configs.get_mut(&ServiceKind::Stt) {
                stt.connect_timeout_ms = 5000;
                stt.retry_attempts = 2;
            }
            if let Some(tts) = configs.get_mut(&ServiceKind::Tts) {
                tts.connect_timeout_ms = 5000;
            }
        }
        // Rebuild on next use so the new limits take effect.
        let mut clients = self.clients.lock().unwrap();
        clients.clear();
        info!("connection pools optimized for realtime workloads");
    }
}

fn build_client(config: &PoolConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(config.max_connections)
        .pool_idle_timeout(Duration::from_secs(config.keepalive_timeout_secs))
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .timeout(Duration::from_millis(
            config.connect_timeout_ms + config.read_timeout_ms,
        ))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionPoolManager {
        ConnectionPoolManager::new(&PoolsConfig::default())
    }

    #[test]
    fn test_pools_created_lazily() {
        let mgr = manager();
        assert_eq!(mgr.built_pool_count(), 0);
        let _ = mgr.client(ServiceKind::Llm);
        assert_eq!(mgr.built_pool_count(), 1);
        let _ = mgr.client(ServiceKind::Llm);
        assert_eq!(mgr.built_pool_count(), 1);
    }

    #[test]
    fn test_invalidate_drops_client() {
        let mgr = manager();
        let _ = mgr.client(ServiceKind::Tts);
        mgr.invalidate(ServiceKind::Tts);
        assert_eq!(mgr.built_pool_count(), 0);
    }

    #[test]
    fn test_optimize_for_realtime_retunes_configs() {
        let mgr = manager();
        let _ = mgr.client(ServiceKind::Llm);
        mgr.optimize_for_realtime();

        let llm = mgr.config(ServiceKind::Llm);
        assert_eq!(llm.max_connections, 20);
        assert_eq!(llm.retry_attempts, 1);
        let stt = mgr.config(ServiceKind::Stt);
        assert_eq!(stt.connect_timeout_ms, 5000);
        // Existing clients were dropped for rebuild.
        assert_eq!(mgr.built_pool_count(), 0);
    }

    #[test]
    fn test_stats_math() {
        let mut stats = PoolStats::default();
        stats.requests = 4;
        stats.successes = 3;
        stats.failures = 1;
        stats.total_latency = Duration::from_millis(300);
        assert_eq!(stats.mean_latency(), Duration::from_millis(100));
        assert!((stats.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_stats_optimistic() {
        let stats = PoolStats::default();
        assert_eq!(stats.mean_latency(), Duration::ZERO);
        assert!((stats.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_request_failure_updates_stats() {
        let mgr = ConnectionPoolManager::new(&PoolsConfig {
            external: PoolConfig {
                max_connections: 1,
                keepalive_timeout_secs: 5,
                connect_timeout_ms: 200,
                read_timeout_ms: 200,
                retry_attempts: 1,
                retry_min_delay_ms: 1,
            },
            ..PoolsConfig::default()
        });

        // Nothing listens on this port; connection is refused immediately.
        let result = mgr
            .get_json(ServiceKind::External, "http://127.0.0.1:9/health")
            .await;
        assert!(result.is_err());

        let stats = mgr.stats(ServiceKind::External);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.failures, 1);
    }
}
