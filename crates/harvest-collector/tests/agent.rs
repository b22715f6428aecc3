//! 설정 파일 → 에이전트 → 실제 런타임 → 파일 저장소까지의 통합 테스트.

use std::time::Duration;

use harvest_collector::{Agent, CircuitState, CollectorError, HarvestConfig, RunOutcome};
use harvest_core::{ConfigError, Payload};
use harvest_data::FileSink;

const CHART: &str = r#"{
    "chart": {
        "result": [{
            "meta": {"currency": "USD", "symbol": "MSFT"},
            "timestamp": [1700000000],
            "indicators": {"quote": [{
                "open": [370.0], "high": [372.5], "low": [368.1],
                "close": [371.2], "volume": [2500000]
            }]}
        }],
        "error": null
    }
}"#;

fn config_yaml(base_url: &str, data_dir: &std::path::Path) -> String {
    format!(
        r#"
collectors:
  market_data:
    equities:
      enabled: true
      interval: 3600
      tickers: [MSFT]
      base_url: "{base_url}"
    crypto:
      enabled: false
      interval: 60
      assets: [BTC-USD]
storage:
  type: file
  data_dir: "{data_dir}"
scheduler:
  max_concurrency: 2
  shutdown_grace_secs: 5
"#,
        base_url = base_url,
        data_dir = data_dir.display()
    )
}

#[tokio::test]
async fn test_agent_collects_into_file_sink() {
    let mut server = mockito::Server::new_async().await;
    let chart = server
        .mock("GET", "/v8/finance/chart/MSFT")
        .match_query(mockito::Matcher::Any)
        .with_header("content-type", "application/json")
        .with_body(CHART)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = HarvestConfig::from_yaml_str(&config_yaml(&server.url(), dir.path())).unwrap();

    let agent = Agent::start(&config).await.unwrap();
    let mut runs = agent.subscribe();
    let result = tokio::time::timeout(Duration::from_secs(10), runs.recv())
        .await
        .expect("run finished in time")
        .unwrap();

    assert_eq!(result.collector_id, "market_data.equities");
    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.record_count, 1);

    let status = agent.stop().await.unwrap();
    // 비활성 collector는 스케줄되지 않음
    assert_eq!(status.collectors.len(), 1);
    let equities = status.get("market_data.equities").unwrap();
    assert_eq!(equities.circuit_state, CircuitState::Closed);
    assert!(equities.last_run_at.is_some());
    chart.assert_async().await;

    let sink = FileSink::open(dir.path()).await.unwrap();
    let records = sink.read_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].natural_key, "market_tick:MSFT:1700000000");
    assert_eq!(records[0].source_collector_id, "market_data.equities");
    assert!(matches!(records[0].payload, Payload::MarketTick(_)));
}

#[tokio::test]
async fn test_agent_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = config_yaml("http://127.0.0.1:9", dir.path()).replace("tickers: [MSFT]", "tickers: []");
    let config = HarvestConfig::from_yaml_str(&yaml).unwrap();

    match Agent::start(&config).await {
        Err(CollectorError::Config(ConfigError::MissingParameter { id, parameter })) => {
            assert_eq!(id, "market_data.equities");
            assert_eq!(parameter, "tickers");
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("invalid config accepted"),
    }
}
