//! 공통 설정 섹션.
//!
//! 여러 크레이트가 함께 쓰는 `storage`, `logging` 섹션과
//! 비밀 값 역직렬화 헬퍼를 정의합니다.

use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::logging::{LogConfig, LogFormat};

/// 저장소 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// 카테고리/날짜로 파티션된 JSONL 세그먼트 파일
    #[default]
    File,
    /// PostgreSQL
    Database,
    /// 프로세스 메모리 (테스트, dry run)
    Memory,
}

/// 저장소 설정.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// 저장소 종류
    #[serde(rename = "type", default)]
    pub kind: StorageKind,
    /// 파일 저장소 루트 디렉터리
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 데이터베이스 연결 설정
    #[serde(default)]
    pub database: DatabaseConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            data_dir: default_data_dir(),
            database: DatabaseConfig::default(),
        }
    }
}

/// 데이터베이스 연결 설정.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    #[serde(default = "default_db_name")]
    pub database: String,
    /// 최소 연결 수
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// 최대 연결 수
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// 연결 타임아웃 (초)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_db_user() -> String {
    "postgres".to_string()
}
fn default_db_name() -> String {
    "harvest".to_string()
}
fn default_min_connections() -> u32 {
    1
}
fn default_max_connections() -> u32 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: None,
            database: default_db_name(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// 로깅 설정 섹션.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 로그 레벨 필터
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 출력 형식 (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// span 진입/종료 이벤트 출력 (수집 실행 시간 추적용)
    #[serde(default)]
    pub span_events: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            span_events: false,
        }
    }
}

impl LoggingConfig {
    /// 로깅 초기화용 설정으로 변환합니다.
    ///
    /// `LOG_FORMAT` 환경 변수가 있으면 `format`보다 우선합니다.
    /// 알 수 없는 형식은 pretty로 대체합니다.
    pub fn to_log_config(&self) -> LogConfig {
        let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| self.format.clone());
        LogConfig::new(self.level.clone())
            .with_format(format.parse().unwrap_or(LogFormat::Pretty))
            .with_span_events(self.span_events)
    }
}

/// 선택적 비밀 값 역직렬화.
///
/// 빈 문자열은 값이 없는 것으로 취급합니다.
pub fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .filter(|s| !s.trim().is_empty())
        .map(|s| SecretString::new(s.into())))
}

/// 환경 변수에서 비밀 값을 읽습니다 (비어 있으면 `None`).
pub fn secret_from_env(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(|s| SecretString::new(s.into()))
}
