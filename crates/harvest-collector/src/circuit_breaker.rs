//! Collector별 Circuit Breaker.
//!
//! 연속 실패가 임계치에 도달하면 일정 시간(cool-down) 동안 해당 collector의
//! 디스패치를 중단합니다. 상태는 스케줄러만 변경하므로 잠금 없이 순수한
//! 값 타입으로 구현되어 있고, 시각은 호출 측이 넘겨줍니다.
//!
//! # 상태 전이
//!
//! ```text
//! Closed ──[연속 실패 임계치 도달]──> Open
//!    ↑                                  │
//!    │                         [cool-down 경과]
//!    │                                  ↓
//!    └──[성공]── HalfOpen ──[실패, cool-down 2배]──> Open
//! ```
//!
//! cool-down은 `cool_down_secs · 2^(openings-1)`이며 `max_cool_down_secs`로 제한됩니다.
//! 수집 주기와는 무관합니다.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use harvest_core::ConfigError;

/// Circuit Breaker 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 정상 - 디스패치 허용
    Closed,
    /// 장애 - cool-down 동안 디스패치 중단
    Open,
    /// 복구 테스트 - 한 번의 시험 실행 허용
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit Breaker 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Open으로 전이하는 연속 실패 횟수
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// 첫 Open의 cool-down (초)
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,
    /// cool-down 상한 (초)
    #[serde(default = "default_max_cool_down_secs")]
    pub max_cool_down_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cool_down_secs() -> u64 {
    60
}
fn default_max_cool_down_secs() -> u64 {
    3600
} // 1시간

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down_secs: default_cool_down_secs(),
            max_cool_down_secs: default_max_cool_down_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, cool_down_secs: u64, max_cool_down_secs: u64) -> Self {
        Self {
            failure_threshold,
            cool_down_secs,
            max_cool_down_secs,
        }
    }

    /// 보수적인 설정 (낮은 임계치, 긴 cool-down).
    pub fn conservative() -> Self {
        Self {
            failure_threshold: 3,
            cool_down_secs: 300,
            max_cool_down_secs: 6 * 3600,
        }
    }

    /// 공격적인 설정 (높은 임계치, 짧은 cool-down).
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 10,
            cool_down_secs: 10,
            max_cool_down_secs: 600,
        }
    }

    /// n번째(1부터) Open의 cool-down.
    pub fn cool_down(&self, openings: u32) -> Duration {
        let base = Duration::from_secs(self.cool_down_secs);
        let max = Duration::from_secs(self.max_cool_down_secs.max(self.cool_down_secs));
        let exponent = openings.saturating_sub(1).min(31);
        base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be >= 1".to_string(),
            ));
        }
        if self.cool_down_secs == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.cool_down_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 상태 전이 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 상태 변화 없음
    None,
    /// Open으로 전이 (cool-down)
    Opened(Duration),
    /// HalfOpen 시험 성공으로 Closed 복귀
    Recovered,
}

/// Collector 하나의 Circuit Breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    /// 연속 Open 횟수 (Closed 복귀 시 0)
    openings: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            openings: 0,
            open_until: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn openings(&self) -> u32 {
        self.openings
    }

    /// Open 상태의 cool-down 종료 시각.
    pub fn open_until(&self) -> Option<Instant> {
        match self.state {
            CircuitState::Open => self.open_until,
            _ => None,
        }
    }

    /// 디스패치 허용 여부.
    ///
    /// Open 상태에서 cool-down이 지났으면 HalfOpen으로 전이하고 허용합니다.
    /// 동시 실행은 스케줄러가 막으므로 HalfOpen의 시험 실행은 항상 하나입니다.
    pub fn allows_dispatch(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.open_until {
                Some(until) if now < until => false,
                _ => {
                    self.state = CircuitState::HalfOpen;
                    tracing::info!(openings = self.openings, "Circuit breaker half-open");
                    true
                }
            },
        }
    }

    /// 성공(부분 실패 포함) 기록.
    pub fn record_success(&mut self) -> Transition {
        let recovered = self.state == CircuitState::HalfOpen;
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.openings = 0;
        self.open_until = None;

        if recovered {
            Transition::Recovered
        } else {
            Transition::None
        }
    }

    /// 실패 기록.
    pub fn record_failure(&mut self, now: Instant) -> Transition {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let trip = match self.state {
            CircuitState::Closed => self.consecutive_failures >= self.config.failure_threshold,
            // 복구 시험 실패
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if !trip {
            return Transition::None;
        }

        self.openings = self.openings.saturating_add(1);
        let cool_down = self.config.cool_down(self.openings);
        self.state = CircuitState::Open;
        self.open_until = Some(now + cool_down);
        Transition::Opened(cool_down)
    }

    /// 수동 리셋.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::new(threshold, 60, 3600))
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = breaker(3);
        let now = Instant::now();

        assert_eq!(cb.record_failure(now), Transition::None);
        assert_eq!(cb.record_failure(now), Transition::None);
        assert_eq!(cb.state(), CircuitState::Closed);

        assert_eq!(
            cb.record_failure(now),
            Transition::Opened(Duration::from_secs(60))
        );
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.open_until(), Some(now + Duration::from_secs(60)));
        assert!(!cb.allows_dispatch(now + Duration::from_secs(59)));
    }

    #[test]
    fn test_success_resets_failures() {
        let mut cb = breaker(3);
        let now = Instant::now();

        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success();
        cb.record_failure(now);
        cb.record_failure(now);
        // 성공 이후 다시 2회이므로 아직 Closed
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_success_recovers() {
        let mut cb = breaker(1);
        let now = Instant::now();

        cb.record_failure(now);
        assert!(cb.allows_dispatch(now + Duration::from_secs(60)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(cb.record_success(), Transition::Recovered);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.openings(), 0);
    }

    #[test]
    fn test_half_open_failure_doubles_cool_down() {
        let mut cb = breaker(1);
        let t0 = Instant::now();

        cb.record_failure(t0);
        let t1 = t0 + Duration::from_secs(60);
        assert!(cb.allows_dispatch(t1));

        assert_eq!(
            cb.record_failure(t1),
            Transition::Opened(Duration::from_secs(120))
        );
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allows_dispatch(t1 + Duration::from_secs(119)));
        assert!(cb.allows_dispatch(t1 + Duration::from_secs(120)));
    }

    #[test]
    fn test_cool_down_is_capped() {
        let config = CircuitBreakerConfig::new(1, 60, 300);
        assert_eq!(config.cool_down(1), Duration::from_secs(60));
        assert_eq!(config.cool_down(3), Duration::from_secs(240));
        assert_eq!(config.cool_down(4), Duration::from_secs(300));
        assert_eq!(config.cool_down(100), Duration::from_secs(300));
    }

    #[test]
    fn test_conservative_and_aggressive_presets() {
        let conservative = CircuitBreakerConfig::conservative();
        let aggressive = CircuitBreakerConfig::aggressive();
        assert!(conservative.failure_threshold < aggressive.failure_threshold);
        assert!(conservative.cool_down_secs > aggressive.cool_down_secs);
        assert!(conservative.validate().is_ok());
        assert!(CircuitBreakerConfig::new(0, 60, 60).validate().is_err());
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }

    proptest! {
        #[test]
        fn prop_cool_down_monotonic_and_bounded(
            base in 1u64..600,
            max in 1u64..100_000,
            openings in 1u32..64,
        ) {
            let config = CircuitBreakerConfig::new(1, base, max);
            let current = config.cool_down(openings);
            let next = config.cool_down(openings + 1);

            prop_assert!(next >= current);
            prop_assert!(current <= Duration::from_secs(max.max(base)));
            prop_assert!(current >= Duration::from_secs(base));
        }
    }
}
