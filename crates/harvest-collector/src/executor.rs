//! Collector 한 번 실행.
//!
//! Resilience 계층으로 런타임을 실행하고, 결과 레코드를 저장소에 기록한 뒤
//! [`RunResult`]로 정리합니다. 스케줄러 워커와 `once` 명령이 함께 사용합니다.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use harvest_core::CollectorSpec;
use harvest_data::RecordSink;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::error::FetchError;
use crate::resilience::Resilience;
use crate::runtime::{CollectContext, RuntimeSet};
use crate::stats::{RunOutcome, RunResult};

/// 부분 실패 상세에 포함할 최대 항목 수
const MAX_FAILURE_DETAILS: usize = 5;

/// 실행에 필요한 공유 자원.
#[derive(Clone)]
pub struct RunExecutor {
    runtimes: RuntimeSet,
    resilience: Resilience,
    ctx: CollectContext,
    sink: Arc<dyn RecordSink>,
}

impl RunExecutor {
    pub fn new(
        runtimes: RuntimeSet,
        resilience: Resilience,
        ctx: CollectContext,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            runtimes,
            resilience,
            ctx,
            sink,
        }
    }

    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }

    /// collector를 한 번 실행합니다. 에러는 모두 결과에 담기며 panic도 실패로 기록됩니다.
    pub async fn run(&self, spec: &CollectorSpec, cancel: &CancellationToken) -> RunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!(
            "collector_run",
            collector = %spec.id,
            category = %spec.category,
            run_id = %run_id
        );

        let outcome = AssertUnwindSafe(self.execute(spec, cancel).instrument(span))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Execution {
                outcome: RunOutcome::Failure,
                record_count: 0,
                error_detail: Some("collector task panicked".to_string()),
                attempts: 0,
                captcha_solved: false,
            });

        RunResult {
            run_id,
            collector_id: spec.id.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome: outcome.outcome,
            record_count: outcome.record_count,
            error_detail: outcome.error_detail,
            attempts: outcome.attempts,
            captcha_solved: outcome.captcha_solved,
        }
    }

    async fn execute(&self, spec: &CollectorSpec, cancel: &CancellationToken) -> Execution {
        let Some(runtime) = self.runtimes.get(spec.category) else {
            return Execution::failed(format!("no runtime registered for {}", spec.category), 0);
        };

        debug!(runtime = runtime.name(), "수집 시작");
        let attempted = self
            .resilience
            .execute(runtime.as_ref(), spec, &self.ctx, cancel)
            .await;
        let attempts = attempted.attempts;
        let captcha_solved = attempted.captcha_solved;

        let output = match attempted.result {
            Ok(output) => output,
            Err(e @ FetchError::RateLimitExceeded { .. }) => {
                return Execution {
                    outcome: RunOutcome::SkippedRateLimited,
                    record_count: 0,
                    error_detail: Some(e.to_string()),
                    attempts,
                    captcha_solved,
                };
            }
            Err(e) => {
                return Execution {
                    captcha_solved,
                    ..Execution::failed(e.to_string(), attempts)
                }
            }
        };

        if !output.records.is_empty() {
            match self.sink.write(&output.records).await {
                Ok(summary) => debug!(
                    sink = self.sink.name(),
                    written = summary.written,
                    unchanged = summary.unchanged,
                    "배치 저장 완료"
                ),
                Err(e) => {
                    return Execution {
                        captcha_solved,
                        ..Execution::failed(format!("storage write failed: {}", e), attempts)
                    };
                }
            }
        }

        let (outcome, error_detail) = if output.is_partial() {
            (RunOutcome::PartialFailure, Some(failure_detail(&output.failures)))
        } else {
            (RunOutcome::Success, None)
        };

        Execution {
            outcome,
            record_count: output.records.len(),
            error_detail,
            attempts,
            captcha_solved,
        }
    }
}

struct Execution {
    outcome: RunOutcome,
    record_count: usize,
    error_detail: Option<String>,
    attempts: u32,
    captcha_solved: bool,
}

impl Execution {
    fn failed(detail: String, attempts: u32) -> Self {
        Self {
            outcome: RunOutcome::Failure,
            record_count: 0,
            error_detail: Some(detail),
            attempts,
            captcha_solved: false,
        }
    }
}

fn failure_detail(failures: &[String]) -> String {
    let mut detail = failures
        .iter()
        .take(MAX_FAILURE_DETAILS)
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");
    if failures.len() > MAX_FAILURE_DETAILS {
        detail.push_str(&format!(" (+{} more)", failures.len() - MAX_FAILURE_DETAILS));
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::runtime::test_support::{context, spec};
    use crate::runtime::{CollectOutput, CollectorRuntime};
    use async_trait::async_trait;
    use harvest_core::{Category, NewsArticle, Payload, Record};
    use harvest_data::MemorySink;
    use serde_json::json;
    use std::time::Duration;

    fn article(i: usize) -> Record {
        Record::new(
            "unstructured_data.news",
            Category::News,
            Utc::now(),
            Payload::NewsArticle(NewsArticle {
                source: "Example".to_string(),
                headline: format!("Headline {}", i),
                url: Some(format!("https://example.com/{}", i)),
                summary: None,
            }),
        )
        .unwrap()
    }

    /// 고정된 결과를 반환하는 런타임.
    struct Fixed {
        records: usize,
        failures: Vec<String>,
        error: Option<FetchError>,
        panic: bool,
    }

    #[async_trait]
    impl CollectorRuntime for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn execute(
            &self,
            _spec: &CollectorSpec,
            _ctx: &CollectContext,
        ) -> Result<CollectOutput, FetchError> {
            if self.panic {
                panic!("boom");
            }
            if let Some(e) = &self.error {
                return Err(e.clone());
            }
            Ok(CollectOutput {
                records: (0..self.records).map(article).collect(),
                failures: self.failures.clone(),
            })
        }
    }

    fn fixed(records: usize) -> Fixed {
        Fixed {
            records,
            failures: Vec::new(),
            error: None,
            panic: false,
        }
    }

    fn executor(runtime: Fixed, sink: Arc<MemorySink>) -> RunExecutor {
        let mut runtimes = RuntimeSet::new();
        runtimes.register(Category::News, Arc::new(runtime));
        RunExecutor::new(
            runtimes,
            Resilience::new(
                RetryConfig::deterministic(2, Duration::from_millis(10), Duration::from_millis(10)),
                None,
                Duration::from_secs(1),
            ),
            context(),
            sink,
        )
    }

    fn news_spec() -> CollectorSpec {
        spec("unstructured_data.news", Category::News, json!({}))
    }

    #[tokio::test]
    async fn test_success_writes_batch() {
        let sink = Arc::new(MemorySink::new());
        let result = executor(fixed(3), sink.clone())
            .run(&news_spec(), &CancellationToken::new())
            .await;

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.record_count, 3);
        assert_eq!(result.attempts, 1);
        assert_eq!(sink.len(), 3);
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_records() {
        let sink = Arc::new(MemorySink::new());
        let runtime = Fixed {
            failures: vec!["TSLA: Permanent fetch error: 404".to_string()],
            ..fixed(2)
        };
        let result = executor(runtime, sink.clone())
            .run(&news_spec(), &CancellationToken::new())
            .await;

        assert_eq!(result.outcome, RunOutcome::PartialFailure);
        assert_eq!(result.record_count, 2);
        assert!(result.error_detail.unwrap().contains("TSLA"));
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_storage_failure_downgrades_to_failure() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_batch_after(5);

        let result = executor(fixed(10), sink.clone())
            .run(&news_spec(), &CancellationToken::new())
            .await;

        assert_eq!(result.outcome, RunOutcome::Failure);
        assert_eq!(result.record_count, 0);
        assert!(result.error_detail.unwrap().contains("storage write failed"));
        // 배치는 전부 반영되지 않음
        assert_eq!(sink.len(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_is_skipped() {
        let runtime = Fixed {
            error: Some(FetchError::RateLimitExceeded {
                host: "www.sec.gov".to_string(),
                retry_after: Duration::from_secs(45),
            }),
            ..fixed(0)
        };
        let result = executor(runtime, Arc::new(MemorySink::new()))
            .run(&news_spec(), &CancellationToken::new())
            .await;

        assert_eq!(result.outcome, RunOutcome::SkippedRateLimited);
        assert!(!result.outcome.is_success());
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let runtime = Fixed {
            panic: true,
            ..fixed(0)
        };
        let result = executor(runtime, Arc::new(MemorySink::new()))
            .run(&news_spec(), &CancellationToken::new())
            .await;

        assert_eq!(result.outcome, RunOutcome::Failure);
        assert!(result.error_detail.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_failure() {
        let result = executor(fixed(1), Arc::new(MemorySink::new()))
            .run(
                &spec("macro_data.cpi", Category::Cpi, json!({})),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.outcome, RunOutcome::Failure);
        assert!(result.error_detail.unwrap().contains("no runtime"));
    }

    #[test]
    fn test_failure_detail_is_truncated() {
        let failures: Vec<String> = (0..8).map(|i| format!("item{}: err", i)).collect();
        let detail = failure_detail(&failures);
        assert!(detail.starts_with("item0: err; item1: err"));
        assert!(detail.ends_with("(+3 more)"));
    }
}
