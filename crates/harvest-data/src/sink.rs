//! 레코드 저장소 인터페이스.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::{Record, StorageConfig, StorageKind};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::storage::{FileSink, MemorySink, PgSink};

/// 배치 쓰기 결과.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// 전달받은 레코드 수
    pub received: usize,
    /// 새로 쓰였거나 갱신된 레코드 수
    pub written: usize,
    /// 같은 페이로드가 이미 있어 건너뛴 레코드 수
    pub unchanged: usize,
}

/// 레코드 저장소.
///
/// 구현체는 다음을 보장해야 합니다:
/// - 같은 `natural_key`는 하나의 버전만 남음 (최신 페이로드 우선)
/// - 배치 단위 원자성: 전부 반영되거나, 아무것도 반영되지 않고 에러 반환
/// - 동시에 들어온 배치끼리 서로 섞이지 않음
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// 저장소 이름 (로그용).
    fn name(&self) -> &'static str;

    /// 한 번의 수집 실행에서 나온 레코드를 원자적으로 기록합니다.
    async fn write(&self, records: &[Record]) -> Result<WriteSummary>;

    /// 저장소 상태 확인.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// 연결 정리.
    async fn close(&self) {}
}

/// 배치 내 중복 키를 마지막 항목 기준으로 합칩니다.
///
/// 반환 순서는 각 키가 마지막으로 등장한 위치 순서입니다.
pub fn dedup_last_wins(records: &[Record]) -> Vec<&Record> {
    let mut last: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        last.insert(record.natural_key.as_str(), i);
    }

    records
        .iter()
        .enumerate()
        .filter(|(i, r)| last.get(r.natural_key.as_str()) == Some(i))
        .map(|(_, r)| r)
        .collect()
}

/// 중복을 합친 뒤 `natural_key` 순으로 정렬합니다.
///
/// 같은 키를 쓰는 배치들이 행 잠금을 항상 같은 순서로 잡게 합니다.
pub fn dedup_in_key_order(records: &[Record]) -> Vec<&Record> {
    let mut deduped = dedup_last_wins(records);
    deduped.sort_unstable_by(|a, b| a.natural_key.cmp(&b.natural_key));
    deduped
}

/// 페이로드 내용 해시 (변경 여부 판단용).
pub fn payload_digest(record: &Record) -> Result<String> {
    let bytes = serde_json::to_vec(&record.payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// 설정에 맞는 저장소를 엽니다.
pub async fn open_sink(config: &StorageConfig) -> Result<Arc<dyn RecordSink>> {
    let sink: Arc<dyn RecordSink> = match config.kind {
        StorageKind::File => Arc::new(FileSink::open(&config.data_dir).await?),
        StorageKind::Database => {
            let sink = PgSink::connect(&config.database).await?;
            sink.ensure_schema().await?;
            Arc::new(sink)
        }
        StorageKind::Memory => Arc::new(MemorySink::new()),
    };

    tracing::info!(sink = sink.name(), "Storage sink opened");
    Ok(sink)
}
