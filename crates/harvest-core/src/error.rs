//! 수집 시스템 공통 에러 타입.
//!
//! 시작 시점에 치명적인 설정 에러와 레코드 생성 에러를 정의합니다.
//! 수집/저장 단계의 에러는 각 크레이트에서 정의합니다.

use thiserror::Error;

/// 설정 에러.
///
/// 프로세스 시작 시점에만 발생하며, 발생하면 프로세스는 종료됩니다.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 설정 파일/환경 변수 로드 실패
    #[error("설정 로드 실패: {0}")]
    Load(String),

    /// 수집 주기가 0 이하
    #[error("잘못된 수집 주기 ({id}): {interval}")]
    InvalidInterval { id: String, interval: String },

    /// 중복된 collector id
    #[error("중복된 collector id: {0}")]
    DuplicateId(String),

    /// 알 수 없는 카테고리
    #[error("알 수 없는 카테고리 ({id}): {category}")]
    UnknownCategory { id: String, category: String },

    /// 카테고리별 필수 파라미터 누락
    #[error("필수 파라미터 누락 ({id}): {parameter}")]
    MissingParameter { id: String, parameter: String },

    /// 파라미터 형식 오류
    #[error("잘못된 파라미터 ({id}.{parameter}): {reason}")]
    InvalidParameter {
        id: String,
        parameter: String,
        reason: String,
    },

    /// 기타 잘못된 설정 값
    #[error("잘못된 설정 값: {0}")]
    Invalid(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// 레코드 생성 에러.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// natural key가 비어 있음
    #[error("natural key가 비어 있습니다 ({kind})")]
    EmptyNaturalKey { kind: &'static str },
}

/// 설정 작업을 위한 Result 타입.
pub type ConfigResult<T> = Result<T, ConfigError>;
