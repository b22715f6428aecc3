//! 프로세스 제어.
//!
//! 설정을 읽어 저장소, HTTP 클라이언트, 캡차 풀이기, 런타임을 조립하고
//! 스케줄러를 백그라운드 태스크로 실행합니다. 상태 조회와 실행 결과 구독,
//! graceful stop을 제공합니다.

use std::sync::Arc;

use harvest_core::CollectorSpec;
use harvest_data::{open_sink, RecordSink};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::captcha::{AntiCaptchaSolver, CaptchaSolver};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::HarvestConfig;
use crate::error::{CollectorError, Result};
use crate::executor::RunExecutor;
use crate::http::HttpClient;
use crate::rate_limiter::RateLimiter;
use crate::resilience::Resilience;
use crate::runtime::{CollectContext, RuntimeSet};
use crate::scheduler::{Scheduler, SchedulerConfig, StatusSnapshot};
use crate::stats::RunResult;

/// 설정으로 실행기(저장소, HTTP, 캡차, 런타임)를 조립합니다.
pub async fn build_executor(config: &HarvestConfig) -> Result<RunExecutor> {
    let sink = open_sink(&config.storage).await?;
    sink.health_check().await?;

    let limiter = RateLimiter::new(config.rate_limit.clone());
    let http = HttpClient::new(&config.web_scraping, limiter)?;
    let ctx = CollectContext::new(http, config.credentials.clone());

    let solver = AntiCaptchaSolver::from_config(&config.captcha)
        .map(|solver| Arc::new(solver) as Arc<dyn CaptchaSolver>);
    if solver.is_none() {
        info!("Captcha solver 비활성화 (captcha.api_key 없음)");
    }
    let resilience = Resilience::new(config.retry.clone(), solver, config.captcha.timeout());

    Ok(RunExecutor::new(RuntimeSet::standard(), resilience, ctx, sink))
}

/// 실행 중인 수집 에이전트.
pub struct Agent {
    cancel: CancellationToken,
    handle: JoinHandle<StatusSnapshot>,
    status: watch::Receiver<StatusSnapshot>,
    runs: broadcast::Sender<RunResult>,
    sink: Arc<dyn RecordSink>,
}

impl Agent {
    /// 설정을 검증하고 스케줄링을 시작합니다.
    pub async fn start(config: &HarvestConfig) -> Result<Self> {
        let registry = config.validate()?;
        let specs = registry.list_enabled();
        info!(
            total = registry.len(),
            enabled = specs.len(),
            "Collector 레지스트리 로드 완료"
        );

        let executor = build_executor(config).await?;
        Ok(Self::start_with(
            specs,
            config.scheduler.clone(),
            config.circuit_breaker.clone(),
            executor,
        ))
    }

    /// 조립된 실행기로 스케줄링을 시작합니다.
    pub fn start_with(
        specs: Vec<CollectorSpec>,
        scheduler: SchedulerConfig,
        breaker: CircuitBreakerConfig,
        executor: RunExecutor,
    ) -> Self {
        let sink = executor.sink().clone();
        let scheduler = Scheduler::new(scheduler, specs, breaker, executor);
        let status = scheduler.status_receiver();
        let runs = scheduler.results_sender();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        Self {
            cancel,
            handle,
            status,
            runs,
            sink,
        }
    }

    /// 현재 상태.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// 상태 변경 알림 수신기.
    pub fn status_receiver(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// 이후 완료되는 실행 결과를 구독합니다.
    pub fn subscribe(&self) -> broadcast::Receiver<RunResult> {
        self.runs.subscribe()
    }

    /// 새 디스패치를 멈추고 실행 중인 수집이 끝나길 기다린 뒤 저장소를 닫습니다.
    pub async fn stop(self) -> Result<StatusSnapshot> {
        self.cancel.cancel();
        let snapshot = self
            .handle
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))?;
        self.sink.close().await;
        Ok(snapshot)
    }
}
