//! 저장소 통합 테스트.
//!
//! 데이터베이스 테스트는 `HARVEST_TEST_DATABASE_URL`이 설정된 경우에만 실행됩니다.

use chrono::{TimeZone, Utc};
use harvest_core::{Category, Payload, PriceBar, Record};
use harvest_data::{FileSink, MemorySink, PgSink, RecordSink};
use rust_decimal_macros::dec;

fn tick(asset: &str, close: rust_decimal::Decimal) -> Record {
    Record::new(
        "market_data.equities",
        Category::Equities,
        Utc::now(),
        Payload::MarketTick(PriceBar {
            asset: asset.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            open: None,
            high: None,
            low: None,
            close: Some(close),
            volume: None,
            currency: Some("USD".to_string()),
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
            dividends: None,
            stock_splits: None,
        }),
    )
    .unwrap()
}

fn close_of(record: &Record) -> Option<rust_decimal::Decimal> {
    match &record.payload {
        Payload::MarketTick(bar) => bar.close,
        _ => None,
    }
}

#[tokio::test]
async fn file_sink_reopen_keeps_latest_version() {
    let dir = tempfile::tempdir().unwrap();

    {
        let sink = FileSink::open(dir.path()).await.unwrap();
        sink.write(&[tick("AAPL", dec!(180)), tick("MSFT", dec!(400))])
            .await
            .unwrap();
        sink.write(&[tick("AAPL", dec!(181))]).await.unwrap();
    }

    // 다시 열어도 인덱스가 복원되어 같은 레코드는 건너뜀
    let sink = FileSink::open(dir.path()).await.unwrap();
    assert_eq!(sink.key_count().await, 2);

    let summary = sink.write(&[tick("AAPL", dec!(181))]).await.unwrap();
    assert_eq!(summary.written, 0);
    assert_eq!(summary.unchanged, 1);

    let records = sink.read_all().await.unwrap();
    assert_eq!(records.len(), 2);
    let aapl = records
        .iter()
        .find(|r| r.natural_key.starts_with("market_tick:AAPL"))
        .unwrap();
    assert_eq!(close_of(aapl), Some(dec!(181)));
}

#[tokio::test]
async fn file_sink_duplicate_keys_in_batch_collapse() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileSink::open(dir.path()).await.unwrap();

    let summary = sink
        .write(&[tick("AAPL", dec!(1)), tick("AAPL", dec!(2))])
        .await
        .unwrap();
    assert_eq!(summary.received, 2);
    assert_eq!(summary.written, 1);

    let records = sink.read_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(close_of(&records[0]), Some(dec!(2)));
}

#[tokio::test]
async fn memory_sink_concurrent_batches_do_not_mix() {
    let sink = std::sync::Arc::new(MemorySink::new());

    let mut handles = Vec::new();
    for i in 0..8 {
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            let batch: Vec<Record> = (0..5)
                .map(|j| tick(&format!("T{}-{}", i, j), dec!(1)))
                .collect();
            sink.write(&batch).await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().written, 5);
    }

    assert_eq!(sink.len(), 40);
    assert_eq!(sink.committed_batches(), 8);
}

#[tokio::test]
async fn pg_sink_upsert_is_idempotent() {
    let Ok(url) = std::env::var("HARVEST_TEST_DATABASE_URL") else {
        eprintln!("HARVEST_TEST_DATABASE_URL not set, skipping");
        return;
    };

    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    let sink = PgSink::from_pool(pool);
    sink.ensure_schema().await.unwrap();

    let asset = format!("TEST{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let first = sink.write(&[tick(&asset, dec!(10))]).await.unwrap();
    assert_eq!(first.written, 1);

    let again = sink.write(&[tick(&asset, dec!(10))]).await.unwrap();
    assert_eq!(again.written, 0);

    sink.write(&[tick(&asset, dec!(11))]).await.unwrap();
    let key = tick(&asset, dec!(11)).natural_key;
    let payload = sink.fetch_payload(&key).await.unwrap().unwrap();
    assert_eq!(payload["close"], "11");
}

#[tokio::test]
async fn pg_sink_overlapping_batches_commit() {
    let Ok(url) = std::env::var("HARVEST_TEST_DATABASE_URL") else {
        eprintln!("HARVEST_TEST_DATABASE_URL not set, skipping");
        return;
    };

    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    let sink = std::sync::Arc::new(PgSink::from_pool(pool));
    sink.ensure_schema().await.unwrap();

    // 같은 키 집합을 서로 반대 순서로 쓰는 배치 여러 개
    let prefix = format!("LOCK{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let mut handles = Vec::new();
    for i in 0..6u32 {
        let sink = sink.clone();
        let prefix = prefix.clone();
        handles.push(tokio::spawn(async move {
            let mut batch: Vec<Record> = (0..50)
                .map(|j| tick(&format!("{}-{:02}", prefix, j), rust_decimal::Decimal::from(i)))
                .collect();
            if i % 2 == 1 {
                batch.reverse();
            }
            sink.write(&batch).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}
