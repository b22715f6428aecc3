//! 메모리 저장소.
//!
//! 테스트와 dry run에서 사용합니다. 장애 주입을 지원하며,
//! 주입된 장애가 발생한 배치는 전혀 반영되지 않습니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use harvest_core::Record;

use crate::error::{Result, StorageError};
use crate::sink::{dedup_last_wins, payload_digest, RecordSink, WriteSummary};

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, (String, Record)>,
    batches: usize,
}

/// 프로세스 메모리에 레코드를 보관하는 저장소.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
    /// 다음 배치를 이 개수만큼 스테이징한 뒤 실패시킴
    fail_after: Mutex<Option<usize>>,
    failed_batches: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 다음 배치 한 번을 `written`개 레코드 처리 후 실패하도록 설정합니다.
    pub fn fail_next_batch_after(&self, written: usize) {
        if let Ok(mut fail) = self.fail_after.lock() {
            *fail = Some(written);
        }
    }

    /// 저장된 레코드 수.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 키로 레코드 조회.
    pub fn get(&self, natural_key: &str) -> Option<Record> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.records.get(natural_key).map(|(_, r)| r.clone()))
    }

    /// 저장된 모든 레코드 (키 순서).
    pub fn records(&self) -> Vec<Record> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut records: Vec<Record> = state.records.values().map(|(_, r)| r.clone()).collect();
        records.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        records
    }

    /// 커밋된 배치 수.
    pub fn committed_batches(&self) -> usize {
        self.state.lock().map(|s| s.batches).unwrap_or(0)
    }

    /// 실패한 배치 수.
    pub fn failed_batches(&self) -> usize {
        self.failed_batches.load(Ordering::Relaxed)
    }

    fn poisoned() -> StorageError {
        StorageError::Query("memory sink lock poisoned".to_string())
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, records: &[Record]) -> Result<WriteSummary> {
        let fail_after = self.fail_after.lock().map_err(|_| Self::poisoned())?.take();
        let mut state = self.state.lock().map_err(|_| Self::poisoned())?;

        // 스테이징 후 한 번에 반영
        let mut staged = Vec::new();
        let mut summary = WriteSummary {
            received: records.len(),
            ..Default::default()
        };

        for record in dedup_last_wins(records) {
            if fail_after == Some(staged.len()) {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                return Err(StorageError::Injected {
                    written: staged.len(),
                });
            }

            let digest = payload_digest(record)?;
            match state.records.get(&record.natural_key) {
                Some((existing, _)) if *existing == digest => summary.unchanged += 1,
                _ => staged.push((digest, record.clone())),
            }
        }

        summary.written = staged.len();
        for (digest, record) in staged {
            state
                .records
                .insert(record.natural_key.clone(), (digest, record));
        }
        state.batches += 1;

        Ok(summary)
    }
}
