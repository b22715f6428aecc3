//! Harvest collector CLI.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use harvest_collector::{build_executor, Agent, HarvestConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "harvest-collector")]
#[command(about = "Financial data collector orchestration engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 설정 파일 경로
    #[arg(long, short, global = true, default_value = "config/collector.yaml")]
    config: PathBuf,

    /// 로그 레벨 (trace, debug, info, warn, error). 설정 파일 값보다 우선
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// 스케줄러 실행 (Ctrl-C로 종료)
    Run,

    /// 설정 검증 및 collector 목록 출력
    Check,

    /// collector 하나를 한 번 실행
    Once {
        /// collector id (예: market_data.equities)
        collector_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = HarvestConfig::load(&cli.config)
        .with_context(|| format!("설정 로드 실패: {}", cli.config.display()))?;

    // 로깅 초기화
    let mut log_config = config.logging.to_log_config();
    if let Some(level) = &cli.log_level {
        log_config.level = level.clone();
    }
    harvest_core::init_logging(log_config)
        .map_err(|e| anyhow::anyhow!("로깅 초기화 실패: {}", e))?;

    match cli.command {
        Commands::Run => run(&config).await?,
        Commands::Check => check(&config)?,
        Commands::Once { collector_id } => once(&config, &collector_id).await?,
    }

    Ok(())
}

async fn run(config: &HarvestConfig) -> anyhow::Result<()> {
    tracing::info!("Harvest Collector 시작");
    let agent = Agent::start(config).await?;

    let mut status_log = tokio::time::interval(config.scheduler.status_log_interval());
    status_log.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // 첫 tick은 즉시 발생
    status_log.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("종료 신호 수신, 실행 중인 수집 정리 중...");
                break;
            }
            _ = status_log.tick() => agent.status().log_table(),
        }
    }

    let snapshot = agent.stop().await?;
    snapshot.log_table();
    tracing::info!("Harvest Collector 종료");
    Ok(())
}

fn check(config: &HarvestConfig) -> anyhow::Result<()> {
    let registry = config.validate()?;

    println!("{:<40} {:<16} {:>10}  {}", "COLLECTOR", "CATEGORY", "INTERVAL", "ENABLED");
    for spec in registry.iter() {
        println!(
            "{:<40} {:<16} {:>9}s  {}",
            spec.id, spec.category, spec.interval_seconds, spec.enabled
        );
    }
    println!(
        "\n{} collectors, {} enabled, storage: {:?}",
        registry.len(),
        registry.list_enabled().len(),
        config.storage.kind
    );
    Ok(())
}

async fn once(config: &HarvestConfig, collector_id: &str) -> anyhow::Result<()> {
    let registry = config.validate()?;
    let spec = registry.get(collector_id)?;

    let executor = build_executor(config).await?;
    let result = executor.run(spec, &CancellationToken::new()).await;
    result.log_summary();
    executor.sink().close().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.outcome.is_success() {
        Ok(())
    } else {
        anyhow::bail!("{} 수집 실패: {}", collector_id, result.outcome)
    }
}
