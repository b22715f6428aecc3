//! # Harvest Data
//!
//! 수집 레코드 저장소를 제공합니다.
//!
//! - [`FileSink`]: 카테고리/날짜 파티션의 JSONL 세그먼트 파일
//! - [`PgSink`]: PostgreSQL 일괄 upsert
//! - [`MemorySink`]: 테스트/dry run용 메모리 저장소
//!
//! 모든 구현은 [`RecordSink`] 트레이트를 따르며, `natural_key` 기준으로
//! 멱등하고 배치 단위로 원자적입니다.

pub mod error;
pub mod sink;
pub mod storage;

pub use error::{Result, StorageError};
pub use sink::{dedup_in_key_order, dedup_last_wins, open_sink, RecordSink, WriteSummary};
pub use storage::{FileSink, MemorySink, PgSink};
