//! # Harvest Core
//!
//! 금융 데이터 수집기의 핵심 타입을 제공합니다:
//! - 수집기 정의 ([`CollectorSpec`], [`Category`])
//! - 정규화된 레코드와 페이로드 ([`Record`], [`Payload`])
//! - 공통 설정 섹션 (저장소, 로깅)
//! - 시작 시점 에러 타입
//! - 로깅 인프라

pub mod config;
pub mod error;
pub mod logging;
pub mod record;
pub mod spec;

pub use config::*;
pub use error::*;
pub use logging::*;
pub use record::*;
pub use spec::*;
