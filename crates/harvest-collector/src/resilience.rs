//! Resilience 계층.
//!
//! 모든 런타임 호출을 감쌉니다:
//! - [`FetchError::Transient`]: 지수 백오프 + jitter로 `max_attempts`까지 재시도
//! - [`FetchError::Permanent`]: 재시도 없이 실패
//! - [`FetchError::Captcha`]: 풀이 서비스로 토큰을 받아 한 번 더 시도
//!   (재시도 횟수를 소모하지 않음). 풀이 실패, 타임아웃, 풀이기 없음,
//!   재시도에서 다시 캡차가 나오면 Permanent
//! - [`FetchError::RateLimitExceeded`]: 그대로 반환 (스케줄러가 건너뜀 처리)
//!
//! circuit breaker는 스케줄러가 실행 결과로 갱신합니다.

use std::sync::Arc;
use std::time::Duration;

use harvest_core::CollectorSpec;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::captcha::{CaptchaChallenge, CaptchaSolver};
use crate::error::FetchError;
use crate::retry::RetryConfig;
use crate::runtime::{CollectContext, CollectOutput, CollectorRuntime};

/// Resilience 계층을 거친 실행 결과.
#[derive(Debug)]
pub struct Attempted {
    pub result: Result<CollectOutput, FetchError>,
    /// 실제 fetch 시도 횟수 (캡차 재시도 포함)
    pub attempts: u32,
    pub captcha_solved: bool,
    /// 재시도 대기에 쓴 총 시간
    pub backoff_total: Duration,
}

/// 재시도/캡차 정책.
#[derive(Clone)]
pub struct Resilience {
    retry: RetryConfig,
    solver: Option<Arc<dyn CaptchaSolver>>,
    captcha_timeout: Duration,
}

impl Resilience {
    pub fn new(
        retry: RetryConfig,
        solver: Option<Arc<dyn CaptchaSolver>>,
        captcha_timeout: Duration,
    ) -> Self {
        Self {
            retry,
            solver,
            captcha_timeout,
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn has_solver(&self) -> bool {
        self.solver.is_some()
    }

    /// 런타임을 정책에 따라 실행합니다.
    ///
    /// 백오프 대기 중 `cancel`이 발생하면 마지막 에러로 즉시 반환합니다.
    pub async fn execute(
        &self,
        runtime: &dyn CollectorRuntime,
        spec: &CollectorSpec,
        ctx: &CollectContext,
        cancel: &CancellationToken,
    ) -> Attempted {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut tries = 0u32;
        let mut attempts = 0u32;
        let mut captcha_solved = false;
        let mut backoff_total = Duration::ZERO;

        loop {
            tries += 1;
            attempts += 1;

            let mut result = runtime.execute(spec, ctx).await;
            if let Err(FetchError::Captcha(challenge)) = result {
                result = self
                    .escalate(runtime, spec, ctx, challenge, &mut attempts, &mut captcha_solved)
                    .await;
            }

            let error = match result {
                Err(e) if e.is_retryable() && tries < max_attempts => e,
                result => {
                    return Attempted {
                        result,
                        attempts,
                        captcha_solved,
                        backoff_total,
                    }
                }
            };

            let delay = self.retry.backoff(tries);
            warn!(
                collector = %spec.id,
                attempt = tries,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient fetch error, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Attempted {
                        result: Err(error),
                        attempts,
                        captcha_solved,
                        backoff_total,
                    };
                }
                _ = tokio::time::sleep(delay) => {
                    backoff_total += delay;
                }
            }
        }
    }

    /// 캡차를 풀고 토큰을 실어 한 번 더 시도합니다.
    async fn escalate(
        &self,
        runtime: &dyn CollectorRuntime,
        spec: &CollectorSpec,
        ctx: &CollectContext,
        challenge: CaptchaChallenge,
        attempts: &mut u32,
        captcha_solved: &mut bool,
    ) -> Result<CollectOutput, FetchError> {
        let Some(solver) = &self.solver else {
            return Err(FetchError::Permanent(format!(
                "captcha challenge at {} and no solver configured",
                challenge
            )));
        };

        info!(collector = %spec.id, page = %challenge.page_url, "캡차 감지, 풀이 요청");
        let token = match tokio::time::timeout(self.captcha_timeout, solver.solve(&challenge)).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                return Err(FetchError::Permanent(format!("captcha solve failed: {}", e)));
            }
            Err(_) => {
                return Err(FetchError::Permanent(format!(
                    "captcha solve timed out after {:?}",
                    self.captcha_timeout
                )));
            }
        };

        *captcha_solved = true;
        *attempts += 1;
        match runtime.execute(spec, &ctx.with_captcha_token(&token)).await {
            Err(FetchError::Captcha(again)) => Err(FetchError::Permanent(format!(
                "captcha persisted after solving: {}",
                again
            ))),
            other => other,
        }
    }
}
