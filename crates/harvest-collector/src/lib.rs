//! 금융 데이터 수집 오케스트레이션 엔진.
//!
//! 이 crate는 서로 다른 주기와 장애 특성을 가진 수집기들을 하나의
//! 프로세스에서 실행합니다:
//! - 설정 기반 collector 레지스트리
//! - 호스트별 rate limit이 적용된 HTTP 클라이언트와 카테고리별 런타임
//! - 재시도/circuit breaker/캡차 처리 (Resilience 계층)
//! - drift 보정, tick 합침, 동시 실행 제한이 적용된 스케줄러

pub mod agent;
pub mod captcha;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod rate_limiter;
pub mod registry;
pub mod resilience;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod stats;

pub use agent::{build_executor, Agent};
pub use captcha::{AntiCaptchaSolver, CaptchaChallenge, CaptchaConfig, CaptchaError, CaptchaSolver};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::HarvestConfig;
pub use error::{CollectorError, FetchError, Result};
pub use executor::RunExecutor;
pub use http::{HttpClient, WebScrapingConfig};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use registry::CollectorRegistry;
pub use resilience::{Attempted, Resilience};
pub use retry::RetryConfig;
pub use runtime::{CollectContext, CollectOutput, CollectorRuntime, Credentials, RuntimeSet};
pub use scheduler::{
    CollectorStatus, EntryState, Scheduler, SchedulerConfig, StatusSnapshot,
};
pub use stats::{RunCounters, RunOutcome, RunResult};
