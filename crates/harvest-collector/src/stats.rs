//! 실행 결과 및 통계 구조체.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 실행 결과 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// 모든 항목 성공
    Success,
    /// 일부 항목 실패 (스케줄링상 성공으로 취급)
    PartialFailure,
    /// 실패
    Failure,
    /// 로컬 rate limit 대기 한도 초과로 건너뜀 (circuit 영향 없음)
    SkippedRateLimited,
}

impl RunOutcome {
    /// circuit breaker 관점의 성공 여부.
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success | RunOutcome::PartialFailure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::PartialFailure => "partial_failure",
            RunOutcome::Failure => "failure",
            RunOutcome::SkippedRateLimited => "skipped_rate_limited",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 한 번의 collector 실행 결과.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub collector_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// 저장소에 넘긴 레코드 수
    pub record_count: usize,
    pub error_detail: Option<String>,
    /// 사용한 fetch 시도 횟수
    pub attempts: u32,
    pub captcha_solved: bool,
}

impl RunResult {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// 결과 로그 출력
    pub fn log_summary(&self) {
        let elapsed = format!("{:.1}s", self.elapsed().num_milliseconds() as f64 / 1000.0);
        match self.outcome {
            RunOutcome::Success => tracing::info!(
                collector = %self.collector_id,
                records = self.record_count,
                attempts = self.attempts,
                captcha_solved = self.captcha_solved,
                elapsed = %elapsed,
                "수집 완료"
            ),
            RunOutcome::PartialFailure => tracing::warn!(
                collector = %self.collector_id,
                records = self.record_count,
                attempts = self.attempts,
                failures = self.error_detail.as_deref().unwrap_or(""),
                elapsed = %elapsed,
                "수집 부분 실패"
            ),
            RunOutcome::Failure => tracing::error!(
                collector = %self.collector_id,
                attempts = self.attempts,
                error = self.error_detail.as_deref().unwrap_or(""),
                elapsed = %elapsed,
                "수집 실패"
            ),
            RunOutcome::SkippedRateLimited => tracing::warn!(
                collector = %self.collector_id,
                detail = self.error_detail.as_deref().unwrap_or(""),
                "Rate limit으로 수집 건너뜀"
            ),
        }
    }
}

/// 누적 실행 통계
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// 총 실행 횟수
    pub total: u64,
    pub success: u64,
    pub partial: u64,
    pub failures: u64,
    pub skipped: u64,
    /// 저장소에 넘긴 총 레코드 수
    pub records: u64,
}

impl RunCounters {
    pub fn record(&mut self, result: &RunResult) {
        self.total += 1;
        self.records += result.record_count as u64;
        match result.outcome {
            RunOutcome::Success => self.success += 1,
            RunOutcome::PartialFailure => self.partial += 1,
            RunOutcome::Failure => self.failures += 1,
            RunOutcome::SkippedRateLimited => self.skipped += 1,
        }
    }

    /// 성공률 계산 (%, 부분 실패 포함)
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            ((self.success + self.partial) as f64 / self.total as f64) * 100.0
        }
    }
}

/// collector별 최근 실행 결과 (고정 크기 ring buffer).
#[derive(Debug, Clone)]
pub struct RunHistory {
    capacity: usize,
    results: VecDeque<RunResult>,
    counters: RunCounters,
}

impl RunHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            results: VecDeque::with_capacity(capacity),
            counters: RunCounters::default(),
        }
    }

    pub fn push(&mut self, result: RunResult) {
        self.counters.record(&result);
        if self.results.len() == self.capacity {
            self.results.pop_front();
        }
        self.results.push_back(result);
    }

    pub fn last(&self) -> Option<&RunResult> {
        self.results.back()
    }

    /// 오래된 것부터.
    pub fn iter(&self) -> impl Iterator<Item = &RunResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: RunOutcome, records: usize) -> RunResult {
        let now = Utc::now();
        RunResult {
            run_id: Uuid::new_v4(),
            collector_id: "market_data.equities".to_string(),
            started_at: now,
            finished_at: now + chrono::Duration::milliseconds(1500),
            outcome,
            record_count: records,
            error_detail: None,
            attempts: 1,
            captcha_solved: false,
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = RunHistory::new(3);
        for i in 0..5 {
            history.push(result(RunOutcome::Success, i));
        }

        assert_eq!(history.len(), 3);
        // 가장 오래된 2개는 밀려남
        assert_eq!(history.iter().next().unwrap().record_count, 2);
        assert_eq!(history.last().unwrap().record_count, 4);
        assert_eq!(history.counters().total, 5);
        assert_eq!(history.counters().records, 10);
    }

    #[test]
    fn test_counters_success_rate() {
        let mut counters = RunCounters::default();
        assert_eq!(counters.success_rate(), 0.0);

        counters.record(&result(RunOutcome::Success, 1));
        counters.record(&result(RunOutcome::PartialFailure, 1));
        counters.record(&result(RunOutcome::Failure, 0));
        counters.record(&result(RunOutcome::SkippedRateLimited, 0));

        assert_eq!(counters.success_rate(), 50.0);
        assert_eq!(counters.skipped, 1);
    }

    #[test]
    fn test_outcome_classification() {
        assert!(RunOutcome::PartialFailure.is_success());
        assert!(!RunOutcome::Failure.is_success());
        assert!(!RunOutcome::SkippedRateLimited.is_success());
        assert_eq!(RunOutcome::SkippedRateLimited.to_string(), "skipped_rate_limited");
    }

    #[test]
    fn test_elapsed() {
        assert_eq!(result(RunOutcome::Success, 0).elapsed().num_milliseconds(), 1500);
    }
}
