//! PostgreSQL 저장소.
//!
//! 배치 하나를 트랜잭션 하나로 기록합니다. UNNEST 일괄 upsert로
//! `natural_key` 충돌 시 최신 페이로드로 갱신합니다.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{DatabaseConfig, Record};
use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};

use crate::error::{Result, StorageError};
use crate::sink::{dedup_in_key_order, RecordSink, WriteSummary};

/// 한 번의 쿼리로 보낼 최대 행 수.
const CHUNK_SIZE: usize = 500;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collected_records (
    natural_key  TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    category     TEXT NOT NULL,
    collector_id TEXT NOT NULL,
    captured_at  TIMESTAMPTZ NOT NULL,
    payload      JSONB NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CATEGORY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_collected_records_category_captured
    ON collected_records (category, captured_at DESC)
"#;

/// 연결 풀 기반 PostgreSQL 저장소.
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    /// 연결 풀을 생성합니다.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Connecting to database..."
        );

        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.database);
        if let Some(password) = &config.password {
            options = options.password(password.expose_secret());
        }

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!("Database connection established");
        Ok(Self { pool })
    }

    /// 기존 연결 풀을 재사용합니다.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 테이블과 인덱스를 생성합니다 (이미 있으면 무시).
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        sqlx::query(CATEGORY_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// 키로 저장된 페이로드를 조회합니다.
    pub async fn fetch_payload(&self, natural_key: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload::text FROM collected_records WHERE natural_key = $1")
                .bind(natural_key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(text,)| serde_json::from_str(&text).map_err(StorageError::from))
            .transpose()
    }
}

#[async_trait]
impl RecordSink for PgSink {
    fn name(&self) -> &'static str {
        "database"
    }

    #[instrument(skip_all, fields(records = records.len()))]
    async fn write(&self, records: &[Record]) -> Result<WriteSummary> {
        let mut summary = WriteSummary {
            received: records.len(),
            ..Default::default()
        };
        // 키 순서로 upsert해 겹치는 배치끼리 교착 상태가 생기지 않게 함
        let deduped = dedup_in_key_order(records);
        if deduped.is_empty() {
            return Ok(summary);
        }

        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;

        for chunk in deduped.chunks(CHUNK_SIZE) {
            let keys: Vec<&str> = chunk.iter().map(|r| r.natural_key.as_str()).collect();
            let kinds: Vec<&str> = chunk.iter().map(|r| r.kind()).collect();
            let categories: Vec<&str> = chunk.iter().map(|r| r.category.as_str()).collect();
            let collectors: Vec<&str> = chunk
                .iter()
                .map(|r| r.source_collector_id.as_str())
                .collect();
            let captured: Vec<DateTime<Utc>> = chunk.iter().map(|r| r.captured_at).collect();
            let payloads = chunk
                .iter()
                .map(|r| serde_json::to_string(&r.payload))
                .collect::<std::result::Result<Vec<String>, _>>()?;

            // 페이로드가 같으면 갱신하지 않음 (rows_affected에서 제외)
            let result = sqlx::query(
                r#"
                INSERT INTO collected_records
                    (natural_key, kind, category, collector_id, captured_at, payload, updated_at)
                SELECT natural_key, kind, category, collector_id, captured_at, payload::jsonb, NOW()
                FROM UNNEST(
                    $1::text[], $2::text[], $3::text[], $4::text[],
                    $5::timestamptz[], $6::text[]
                ) AS t(natural_key, kind, category, collector_id, captured_at, payload)
                ON CONFLICT (natural_key) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    category = EXCLUDED.category,
                    collector_id = EXCLUDED.collector_id,
                    captured_at = EXCLUDED.captured_at,
                    payload = EXCLUDED.payload,
                    updated_at = NOW()
                WHERE collected_records.payload IS DISTINCT FROM EXCLUDED.payload
                "#,
            )
            .bind(&keys)
            .bind(&kinds)
            .bind(&categories)
            .bind(&collectors)
            .bind(&captured)
            .bind(&payloads)
            .execute(&mut *tx)
            .await?;

            affected += result.rows_affected();
        }

        // 실패 시 tx가 drop되며 롤백
        tx.commit().await?;

        summary.written = affected as usize;
        summary.unchanged = deduped.len() - summary.written;
        debug!(
            written = summary.written,
            unchanged = summary.unchanged,
            "Batch upserted"
        );
        Ok(summary)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
