//! 에러 타입 정의.

use std::time::Duration;

use harvest_core::{ConfigError, RecordError};
use harvest_data::StorageError;
use thiserror::Error;

use crate::captcha::CaptchaChallenge;

/// 수집(fetch) 에러.
///
/// 런타임이 반환하며, Resilience 계층이 변형에 따라 재시도/캡차 처리/스킵을 결정합니다.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// 재시도 가능한 에러 (타임아웃, 5xx, 원격 rate limit)
    #[error("Transient fetch error: {0}")]
    Transient(String),

    /// 재시도해도 소용없는 에러 (4xx, 잘못된 응답, 셀렉터 불일치, 인증 실패)
    #[error("Permanent fetch error: {0}")]
    Permanent(String),

    /// 캡차 페이지 수신
    #[error("Captcha challenge: {0}")]
    Captcha(CaptchaChallenge),

    /// 로컬 rate limiter 대기 한도 초과
    #[error("Rate limit exceeded for {host} (retry after {retry_after:?})")]
    RateLimitExceeded { host: String, retry_after: Duration },
}

impl FetchError {
    /// 재시도 가능한 에러인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// 항목 단위로 삼키지 않고 실행 전체로 전파해야 하는 에러인지 확인합니다.
    pub fn escalates(&self) -> bool {
        matches!(
            self,
            FetchError::Captcha(_) | FetchError::RateLimitExceeded { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transient(_) => "transient",
            FetchError::Permanent(_) => "permanent",
            FetchError::Captcha(_) => "captcha",
            FetchError::RateLimitExceeded { .. } => "rate_limited",
        }
    }
}

impl From<RecordError> for FetchError {
    fn from(err: RecordError) -> Self {
        FetchError::Permanent(err.to_string())
    }
}

/// Collector 크레이트 최상위 에러.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// 설정 에러 (시작 시 치명적)
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 저장소 에러
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// 수집 에러
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// 등록되지 않은 collector
    #[error("Collector not found: {0}")]
    NotFound(String),

    /// 스케줄러 태스크 비정상 종료
    #[error("Scheduler task failed: {0}")]
    Scheduler(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, CollectorError>;
