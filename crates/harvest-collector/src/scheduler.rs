//! 수집 스케줄러.
//!
//! 하나의 타이머 루프가 모든 [`ScheduleEntry`]를 소유하고 변경합니다.
//!
//! - 마감 시각 기준 우선순위 큐에서 가장 이른 시각까지 대기
//! - 마감이 지난 항목 중 실행 중이 아닌 것만 Due로 전환 (밀린 tick은 한 번으로 합침)
//! - 전역 semaphore로 동시 실행 수 제한. 자리가 없으면 Due로 남아 다음 wake에 재시도
//! - 워커는 실행 결과를 mpsc 채널로 돌려주고, 루프만 항목을 갱신
//! - 갱신 후 상태 스냅샷을 watch 채널로 게시
//!
//! 다음 마감은 완료 시각이 아니라 예정 시각에서 계산합니다
//! ([`next_deadline`]). circuit이 Open이면 cool-down이 끝날 때까지 미룹니다.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_core::{Category, CollectorSpec, ConfigError};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Transition};
use crate::executor::RunExecutor;
use crate::stats::{RunCounters, RunHistory, RunOutcome, RunResult};

/// 대기할 마감이 없을 때의 최대 대기 시간.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// 스케줄러 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 전역 동시 실행 한도
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// collector별 보관할 실행 결과 수
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// 종료 시 실행 중인 수집을 기다리는 시간 (초)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// 상태 표 로그 주기 (초)
    #[serde(default = "default_status_log_interval_secs")]
    pub status_log_interval_secs: u64,
}

fn default_max_concurrency() -> usize {
    8
}
fn default_history_size() -> usize {
    20
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_status_log_interval_secs() -> u64 {
    300
} // 5분

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            history_size: default_history_size(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            status_log_interval_secs: default_status_log_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_secs(self.status_log_interval_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrency must be >= 1".to_string(),
            ));
        }
        if self.history_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.history_size must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// 다음 마감 시각을 계산합니다.
///
/// 격자점(`scheduled_at + k·interval`) 중 실제 디스패치 시각에서 한 주기 뒤
/// 이후의 첫 점을 사용합니다. 실행 자리를 기다리느라 늦게 시작한 실행도
/// 다음 실행까지 최소 한 주기 간격을 둡니다. 그 점이 이미 지났으면 `now`
/// 이하의 가장 최근 격자점을 반환하며, 밀린 마감이 여러 개여도 한 번만
/// 실행됩니다.
pub fn next_deadline(
    scheduled_at: Instant,
    dispatched_at: Instant,
    interval: Duration,
    now: Instant,
) -> Instant {
    if interval.is_zero() {
        return scheduled_at;
    }

    let earliest = dispatched_at.max(scheduled_at) + interval;
    let lag = earliest.duration_since(scheduled_at);
    let next = grid_point(scheduled_at, interval, lag.as_nanos().div_ceil(interval.as_nanos()));
    if next > now {
        return next;
    }

    let behind = now.duration_since(scheduled_at);
    grid_point(scheduled_at, interval, behind.as_nanos() / interval.as_nanos())
}

fn grid_point(origin: Instant, interval: Duration, periods: u128) -> Instant {
    let periods = u32::try_from(periods).unwrap_or(u32::MAX);
    origin
        .checked_add(interval.saturating_mul(periods))
        .unwrap_or(origin)
}

// ==================== Schedule Entry ====================

/// 항목 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// 다음 마감 대기
    Idle,
    /// 마감 경과, 실행 자리 대기
    Due,
    /// 실행 중
    Running,
    /// circuit Open, cool-down 대기
    Backoff,
}

/// collector 하나의 스케줄 상태. 스케줄러 루프만 변경합니다.
#[derive(Debug)]
pub struct ScheduleEntry {
    spec: Arc<CollectorSpec>,
    interval: Duration,
    /// 현재/마지막 실행의 예정 시각 (drift 보정 기준)
    scheduled_at: Instant,
    /// 현재/마지막 실행이 실제로 시작된 시각
    dispatched_at: Instant,
    next_due_at: Instant,
    state: EntryState,
    last_run_at: Option<DateTime<Utc>>,
    last_outcome: Option<RunOutcome>,
    breaker: CircuitBreaker,
    history: RunHistory,
}

impl ScheduleEntry {
    fn new(
        spec: CollectorSpec,
        breaker: CircuitBreakerConfig,
        history_size: usize,
        start: Instant,
    ) -> Self {
        Self {
            interval: spec.interval(),
            spec: Arc::new(spec),
            scheduled_at: start,
            dispatched_at: start,
            next_due_at: start,
            state: EntryState::Idle,
            last_run_at: None,
            last_outcome: None,
            breaker: CircuitBreaker::new(breaker),
            history: RunHistory::new(history_size),
        }
    }

    pub fn collector_id(&self) -> &str {
        &self.spec.id
    }

    pub fn next_due_at(&self) -> Instant {
        self.next_due_at
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.consecutive_failures()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// 실행 결과를 반영하고 다음 마감을 정합니다.
    fn complete(&mut self, result: &RunResult, now: Instant) -> Transition {
        self.last_run_at = Some(result.finished_at);
        self.last_outcome = Some(result.outcome);
        self.history.push(result.clone());

        let transition = match result.outcome {
            RunOutcome::Success | RunOutcome::PartialFailure => self.breaker.record_success(),
            RunOutcome::Failure => self.breaker.record_failure(now),
            RunOutcome::SkippedRateLimited => Transition::None,
        };

        let mut next = next_deadline(self.scheduled_at, self.dispatched_at, self.interval, now);
        match self.breaker.open_until() {
            Some(until) => {
                next = next.max(until);
                self.state = EntryState::Backoff;
            }
            None => self.state = EntryState::Idle,
        }
        self.next_due_at = next.max(self.next_due_at);
        transition
    }

    fn status(&self, now: Instant, now_utc: DateTime<Utc>) -> CollectorStatus {
        let until_due = self.next_due_at.saturating_duration_since(now);
        let next_due_at = chrono::Duration::from_std(until_due)
            .map(|d| now_utc + d)
            .unwrap_or(now_utc);
        let last = self.history.last();

        CollectorStatus {
            collector_id: self.spec.id.clone(),
            category: self.spec.category,
            interval_seconds: self.spec.interval_seconds,
            state: self.state,
            last_run_at: self.last_run_at,
            last_outcome: self.last_outcome,
            last_error: last.and_then(|r| r.error_detail.clone()),
            consecutive_failures: self.breaker.consecutive_failures(),
            circuit_state: self.breaker.state(),
            next_due_at,
            counters: self.history.counters().clone(),
            recent_runs: self.history.iter().cloned().collect(),
        }
    }
}

// ==================== Status ====================

/// collector 상태 조회 결과.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub collector_id: String,
    pub category: Category,
    pub interval_seconds: u64,
    pub state: EntryState,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<RunOutcome>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
    /// 다음 마감 (실행 중이면 직전 예정 시각)
    pub next_due_at: DateTime<Utc>,
    pub counters: RunCounters,
    /// 최근 실행 결과 (오래된 것부터)
    pub recent_runs: Vec<RunResult>,
}

/// 전체 상태 스냅샷.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    /// 실행 중인 수집 수
    pub running: usize,
    /// id 순
    pub collectors: Vec<CollectorStatus>,
}

impl StatusSnapshot {
    pub fn get(&self, collector_id: &str) -> Option<&CollectorStatus> {
        self.collectors
            .iter()
            .find(|c| c.collector_id == collector_id)
    }

    /// Open/HalfOpen 상태인 collector 수.
    pub fn tripped(&self) -> usize {
        self.collectors
            .iter()
            .filter(|c| c.circuit_state != CircuitState::Closed)
            .count()
    }

    /// collector별 상태를 한 줄씩 로그로 출력합니다.
    pub fn log_table(&self) {
        info!(
            collectors = self.collectors.len(),
            running = self.running,
            tripped = self.tripped(),
            "=== 수집 상태 ==="
        );
        for c in &self.collectors {
            let last = c
                .last_outcome
                .map(|o| o.as_str())
                .unwrap_or("-");
            info!(
                collector = %c.collector_id,
                state = ?c.state,
                last = last,
                failures = c.consecutive_failures,
                circuit = %c.circuit_state,
                next_due = %c.next_due_at.format("%H:%M:%S"),
                success_rate = %format!("{:.1}%", c.counters.success_rate()),
                records = c.counters.records,
                "collector"
            );
        }
    }
}

// ==================== Scheduler ====================

/// 워커 → 루프 보고.
struct Completed {
    collector_id: String,
    result: RunResult,
}

/// 타이머 기반 스케줄러.
pub struct Scheduler {
    config: SchedulerConfig,
    executor: RunExecutor,
    entries: HashMap<String, ScheduleEntry>,
    /// (마감, 순번, id) 최소 힙. 오래된 항목은 꺼낼 때 무시
    queue: BinaryHeap<Reverse<(Instant, u64, String)>>,
    seq: u64,
    /// 실행 자리를 기다리는 Due 항목 (마감 순)
    pending: VecDeque<String>,
    semaphore: Arc<Semaphore>,
    running: usize,
    tasks: JoinSet<()>,
    results_tx: mpsc::UnboundedSender<Completed>,
    results_rx: mpsc::UnboundedReceiver<Completed>,
    status_tx: watch::Sender<StatusSnapshot>,
    runs_tx: broadcast::Sender<RunResult>,
}

impl Scheduler {
    /// 모든 collector는 시작 시점에 바로 실행 대상이 됩니다.
    pub fn new(
        config: SchedulerConfig,
        specs: Vec<CollectorSpec>,
        breaker: CircuitBreakerConfig,
        executor: RunExecutor,
    ) -> Self {
        let start = Instant::now();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(StatusSnapshot::default());
        let (runs_tx, _) = broadcast::channel(256);

        let mut scheduler = Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            executor,
            entries: HashMap::with_capacity(specs.len()),
            queue: BinaryHeap::with_capacity(specs.len()),
            seq: 0,
            pending: VecDeque::new(),
            running: 0,
            tasks: JoinSet::new(),
            results_tx,
            results_rx,
            status_tx,
            runs_tx,
        };

        for spec in specs {
            let entry = ScheduleEntry::new(
                spec,
                breaker.clone(),
                scheduler.config.history_size,
                start,
            );
            let id = entry.collector_id().to_string();
            scheduler.push(start, id.clone());
            scheduler.entries.insert(id, entry);
        }
        scheduler.publish();
        scheduler
    }

    /// 상태 스냅샷 수신기.
    pub fn status_receiver(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// 실행 결과 구독.
    pub fn subscribe(&self) -> broadcast::Receiver<RunResult> {
        self.runs_tx.subscribe()
    }

    pub fn results_sender(&self) -> broadcast::Sender<RunResult> {
        self.runs_tx.clone()
    }

    pub fn entry(&self, collector_id: &str) -> Option<&ScheduleEntry> {
        self.entries.get(collector_id)
    }

    /// 현재 상태 스냅샷.
    pub fn snapshot(&self) -> StatusSnapshot {
        let now = Instant::now();
        let now_utc = Utc::now();
        let mut collectors: Vec<CollectorStatus> = self
            .entries
            .values()
            .map(|e| e.status(now, now_utc))
            .collect();
        collectors.sort_by(|a, b| a.collector_id.cmp(&b.collector_id));

        StatusSnapshot {
            taken_at: Some(now_utc),
            running: self.running,
            collectors,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn push(&mut self, due: Instant, collector_id: String) {
        self.seq += 1;
        self.queue.push(Reverse((due, self.seq, collector_id)));
    }

    /// 취소될 때까지 스케줄링하고, 종료 후 최종 상태를 반환합니다.
    pub async fn run(mut self, cancel: CancellationToken) -> StatusSnapshot {
        info!(
            collectors = self.entries.len(),
            max_concurrency = self.config.max_concurrency,
            "스케줄러 시작"
        );

        loop {
            self.dispatch_due(&cancel);
            self.publish();

            let wake = self
                .queue
                .peek()
                .map(|Reverse((due, _, _))| *due)
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(done) = self.results_rx.recv() => self.complete(done),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "수집 워커 비정상 종료");
                    }
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        self.shutdown().await
    }

    /// 마감이 지난 항목을 Due로 전환하고 자리가 있는 만큼 실행합니다.
    fn dispatch_due(&mut self, cancel: &CancellationToken) {
        let now = Instant::now();

        while let Some(Reverse((due, _, _))) = self.queue.peek() {
            if *due > now {
                break;
            }
            let Some(Reverse((due, _, id))) = self.queue.pop() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            // 갱신된 마감이거나 이미 실행/대기 중이면 무시 (tick 합침)
            if entry.next_due_at != due
                || matches!(entry.state, EntryState::Running | EntryState::Due)
            {
                continue;
            }

            if !entry.breaker.allows_dispatch(now) {
                let until = entry.breaker.open_until().unwrap_or(now + entry.interval);
                entry.next_due_at = until;
                entry.state = EntryState::Backoff;
                self.push(until, id);
                continue;
            }

            entry.state = EntryState::Due;
            entry.scheduled_at = due;
            self.pending.push_back(id);
        }

        while !self.pending.is_empty() {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(waiting = self.pending.len(), "동시 실행 한도 도달, 대기");
                    break;
                }
            };
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };

            entry.state = EntryState::Running;
            entry.dispatched_at = now;
            let spec = entry.spec.clone();
            let executor = self.executor.clone();
            let results = self.results_tx.clone();
            let cancel = cancel.child_token();
            self.running += 1;

            debug!(collector = %id, circuit = %entry.breaker.state(), "수집 디스패치");
            self.tasks.spawn(async move {
                let result = executor.run(&spec, &cancel).await;
                drop(permit);
                let _ = results.send(Completed {
                    collector_id: spec.id.clone(),
                    result,
                });
            });
        }
    }

    /// 워커 결과를 반영합니다.
    fn complete(&mut self, done: Completed) {
        self.running = self.running.saturating_sub(1);
        let now = Instant::now();

        let Some(entry) = self.entries.get_mut(&done.collector_id) else {
            warn!(collector = %done.collector_id, "Result for unknown collector dropped");
            return;
        };

        let transition = entry.complete(&done.result, now);
        let next_due = entry.next_due_at;
        match transition {
            Transition::Opened(cool_down) => warn!(
                collector = %done.collector_id,
                failures = entry.consecutive_failures(),
                cool_down_secs = cool_down.as_secs(),
                "Circuit breaker open"
            ),
            Transition::Recovered => info!(collector = %done.collector_id, "Circuit breaker closed (복구)"),
            Transition::None => {}
        }

        done.result.log_summary();
        debug!(
            collector = %done.collector_id,
            next_due_in_ms = next_due.saturating_duration_since(now).as_millis() as u64,
            "다음 수집 예약"
        );
        self.push(next_due, done.collector_id);
        let _ = self.runs_tx.send(done.result);
    }

    /// 새 디스패치를 멈추고 실행 중인 수집을 유예 시간만큼 기다린 뒤 나머지를 중단합니다.
    async fn shutdown(mut self) -> StatusSnapshot {
        info!(running = self.running, "스케줄러 종료 중...");
        self.pending.clear();

        let deadline = Instant::now() + self.config.shutdown_grace();
        while self.running > 0 {
            tokio::select! {
                Some(done) = self.results_rx.recv() => self.complete(done),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(running = self.running, "유예 시간 초과, 남은 수집 중단");
                    break;
                }
            }
        }

        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        // 중단된 실행과 자리 대기 항목은 더 이상 진행되지 않음
        self.running = 0;
        for entry in self.entries.values_mut() {
            if matches!(entry.state, EntryState::Running | EntryState::Due) {
                entry.state = EntryState::Idle;
            }
        }

        let snapshot = self.snapshot();
        self.status_tx.send_replace(snapshot.clone());
        info!("스케줄러 종료");
        snapshot
    }
}
