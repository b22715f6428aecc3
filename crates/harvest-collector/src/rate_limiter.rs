//! 호스트별 Token Bucket rate limiter.
//!
//! 모든 outbound 요청 직전에 요청 대상 호스트의 토큰을 하나 획득합니다.
//! 토큰이 없으면 다음 토큰이 생길 때까지 대기하며, 대기 시간이
//! `acquire_timeout`을 넘으면 즉시 [`RateLimitExceeded`]로 실패합니다.
//!
//! 토큰은 대기 전에 예약(잔량을 음수로 차감)되므로 같은 호스트를 기다리는
//! 요청들은 도착 순서대로 refill 속도에 맞춰 배치됩니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use harvest_core::ConfigError;

/// 버킷 설정.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BucketConfig {
    /// 버킷 용량 (버스트 허용량)
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// 초당 리필되는 토큰 수
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

fn default_capacity() -> u32 {
    5
}
fn default_refill_per_sec() -> f64 {
    1.0
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

/// 호스트별 버킷 설정.
#[derive(Debug, Clone, Deserialize)]
pub struct HostLimit {
    pub host: String,
    #[serde(flatten)]
    pub bucket: BucketConfig,
}

/// Rate Limiter 설정.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// 별도 설정이 없는 호스트의 버킷
    #[serde(default)]
    pub default: BucketConfig,
    /// 토큰 대기 한도 (초)
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// 호스트별 설정
    #[serde(default)]
    pub hosts: Vec<HostLimit>,
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: BucketConfig::default(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            hosts: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// 엄격한 설정 (버스트 없음).
    pub fn strict(refill_per_sec: f64) -> Self {
        Self {
            default: BucketConfig {
                capacity: 1,
                refill_per_sec,
            },
            ..Default::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// 호스트에 적용할 버킷 설정.
    pub fn bucket_for(&self, host: &str) -> &BucketConfig {
        self.hosts
            .iter()
            .find(|h| h.host.eq_ignore_ascii_case(host))
            .map(|h| &h.bucket)
            .unwrap_or(&self.default)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let buckets = std::iter::once(("default", &self.default))
            .chain(self.hosts.iter().map(|h| (h.host.as_str(), &h.bucket)));

        for (name, bucket) in buckets {
            if bucket.capacity == 0 || !(bucket.refill_per_sec > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "rate_limit bucket '{}' needs capacity >= 1 and refill_per_sec > 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// 토큰 대기 한도 초과.
#[derive(Debug, Clone, Error)]
#[error("Rate limit exceeded for {host}: next token in {retry_after:?}")]
pub struct RateLimitExceeded {
    pub host: String,
    pub retry_after: Duration,
}

/// Token Bucket.
#[derive(Debug)]
struct TokenBucket {
    /// 현재 토큰 수 (예약으로 음수가 될 수 있음)
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(config: &BucketConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity as f64,
            last_refill: now,
            max_tokens: config.capacity as f64,
            refill_rate: config.refill_per_sec,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// 토큰 하나를 예약하고 사용 가능해질 때까지의 대기 시간을 반환합니다.
    ///
    /// 대기 시간이 `max_wait`를 넘으면 예약하지 않고 필요한 대기 시간을 `Err`로 반환합니다.
    fn reserve(&mut self, now: Instant, max_wait: Duration) -> Result<Duration, Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(Duration::ZERO);
        }

        let wait = Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate);
        if wait > max_wait {
            return Err(wait);
        }
        self.tokens -= 1.0;
        Ok(wait)
    }
}

/// 호스트별 Rate Limiter.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(config),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// 호스트의 토큰을 획득합니다.
    ///
    /// 토큰이 있으면 즉시 반환하고, 없으면 대기 후 반환합니다.
    pub async fn acquire(&self, host: &str) -> Result<(), RateLimitExceeded> {
        let host = host.to_ascii_lowercase();
        let wait = {
            let mut buckets = self.buckets.lock().await;
            let now = Instant::now();
            let bucket = buckets
                .entry(host.clone())
                .or_insert_with(|| TokenBucket::new(self.config.bucket_for(&host), now));

            bucket
                .reserve(now, self.config.acquire_timeout())
                .map_err(|retry_after| RateLimitExceeded {
                    host: host.clone(),
                    retry_after,
                })?
        };

        if !wait.is_zero() {
            debug!(host = %host, wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// 현재 추적 중인 호스트 수.
    pub async fn tracked_hosts(&self) -> usize {
        self.buckets.lock().await.len()
    }
}
