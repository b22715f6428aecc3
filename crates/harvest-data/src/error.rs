//! 저장소 오류 타입.

use thiserror::Error;

/// 저장소 쓰기/열기 오류.
///
/// 어떤 변형이든 배치는 전혀 반영되지 않았음을 의미합니다.
#[derive(Debug, Error)]
pub enum StorageError {
    /// 데이터베이스 연결 오류
    #[error("Database connection error: {0}")]
    Connection(String),

    /// 쿼리 실행 오류
    #[error("Query error: {0}")]
    Query(String),

    /// 연결 풀 소진
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// 파일 입출력 오류
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 직렬화/역직렬화 오류
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 손상된 세그먼트
    #[error("Corrupt segment {path}: {reason}")]
    CorruptSegment { path: String, reason: String },

    /// 주입된 장애 (테스트용 메모리 저장소)
    #[error("Injected write failure after {written} records")]
    Injected { written: usize },
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StorageError::PoolExhausted,
            sqlx::Error::Database(db_err) => StorageError::Query(db_err.message().to_string()),
            sqlx::Error::Io(e) => StorageError::Connection(e.to_string()),
            _ => StorageError::Query(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
