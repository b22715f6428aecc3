//! 지수 백오프 재시도 정책.
//!
//! n번째 재시도(1부터) 전 대기 시간:
//!
//! ```text
//! delay(n) = min(base · 2^(n-1) · (1 + j), max),   j ∈ [0, jitter_ratio)
//! ```
//!
//! `jitter_ratio`는 0.5 이하로 제한되므로 상한에 닿기 전까지 대기 시간은
//! 엄격하게 증가합니다.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use harvest_core::ConfigError;

/// 허용되는 최대 jitter 비율
pub const MAX_JITTER_RATIO: f64 = 0.5;

/// 재시도 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 실행당 최대 fetch 시도 횟수 (첫 시도 포함)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 첫 재시도 대기 시간 (밀리초)
    #[serde(default = "default_base_backoff_ms", alias = "base_delay_ms")]
    pub base_backoff_ms: u64,
    /// 대기 시간 상한 (밀리초)
    #[serde(default = "default_max_backoff_ms", alias = "max_delay_ms")]
    pub max_backoff_ms: u64,
    /// 대기 시간에 더해지는 무작위 비율 상한
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
} // 30초
fn default_jitter_ratio() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    /// jitter 없는 설정 (테스트, 결정적 동작).
    pub fn deterministic(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff_ms: base.as_millis() as u64,
            max_backoff_ms: max.as_millis() as u64,
            jitter_ratio: 0.0,
        }
    }

    /// 보수적인 설정 (적은 시도, 긴 대기).
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            jitter_ratio: 0.25,
        }
    }

    /// 공격적인 설정 (많은 시도, 짧은 대기).
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
            jitter_ratio: 0.1,
        }
    }

    fn jitter_ratio(&self) -> f64 {
        if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, MAX_JITTER_RATIO)
        } else {
            0.0
        }
    }

    fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.base_backoff_ms))
    }

    /// jitter 없는 n번째 재시도 대기 시간.
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let base = Duration::from_millis(self.base_backoff_ms);
        let exponent = retry.saturating_sub(1).min(31);
        base.checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
            .min(self.max_backoff())
    }

    /// 주어진 난수로 n번째 재시도 대기 시간을 계산합니다.
    pub fn backoff_with_jitter<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let ratio = self.jitter_ratio();
        let jitter = if ratio > 0.0 { rng.gen_range(0.0..ratio) } else { 0.0 };

        let exponent = retry.saturating_sub(1).min(31);
        let raw = Duration::from_millis(self.base_backoff_ms).as_secs_f64()
            * f64::from(1u32 << exponent)
            * (1.0 + jitter);
        let max = self.max_backoff();

        if raw >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(raw)
        }
    }

    /// n번째 재시도 대기 시간.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_with_jitter(retry, &mut rand::thread_rng())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be >= 1".to_string(),
            ));
        }
        if !(0.0..=MAX_JITTER_RATIO).contains(&self.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_ratio must be within [0, {}]",
                MAX_JITTER_RATIO
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_base_backoff_doubles_until_cap() {
        let config = RetryConfig::deterministic(5, Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(config.base_backoff(1), Duration::from_millis(500));
        assert_eq!(config.base_backoff(2), Duration::from_millis(1000));
        assert_eq!(config.base_backoff(3), Duration::from_millis(2000));
        assert_eq!(config.base_backoff(4), Duration::from_secs(3));
        assert_eq!(config.base_backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let config = RetryConfig::deterministic(3, Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_ratio_is_clamped() {
        let config = RetryConfig {
            jitter_ratio: 5.0,
            ..RetryConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let d = config.backoff_with_jitter(1, &mut rng);
            assert!(d < Duration::from_millis(750), "{:?}", d);
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::conservative().validate().is_ok());
        assert!(RetryConfig::aggressive().validate().is_ok());
        let zero = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_backoff_strictly_increasing_until_cap(
            base_ms in 1u64..2_000,
            max_ms in 1u64..120_000,
            ratio in 0.0f64..=0.5,
            seed in any::<u64>(),
        ) {
            let config = RetryConfig {
                max_attempts: 10,
                base_backoff_ms: base_ms,
                max_backoff_ms: max_ms,
                jitter_ratio: ratio,
            };
            let max = Duration::from_millis(max_ms.max(base_ms));
            let mut rng = StdRng::seed_from_u64(seed);

            let mut previous = Duration::ZERO;
            for retry in 1..=10 {
                let delay = config.backoff_with_jitter(retry, &mut rng);
                prop_assert!(delay <= max);
                if previous < max {
                    prop_assert!(delay > previous, "retry {} delay {:?} <= {:?}", retry, delay, previous);
                } else {
                    prop_assert_eq!(delay, max);
                }
                previous = delay;
            }
        }
    }
}
