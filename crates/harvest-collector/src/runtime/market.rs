//! 가격 차트 런타임 (주식, 선물, 암호화폐).
//!
//! Yahoo Finance v8 chart 엔드포인트에서 심볼별 일봉을 조회합니다.
//! 종가가 없는 봉(장중 미확정 등)은 건너뜁니다. 배당/분할 이벤트는 같은
//! 시각의 봉에 붙이고, 호가와 호가 수량은 차트 메타데이터에서 가져옵니다.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use harvest_core::{CollectorSpec, Payload, PriceBar};
use serde::Deserialize;

use super::{
    base_url, collect_items, decimal, endpoint, record, CollectContext, CollectOutput,
    CollectorRuntime,
};
use crate::error::FetchError;

const YAHOO_BASE: &str = "https://query1.finance.yahoo.com";

/// 가격 차트 런타임.
#[derive(Debug, Clone, Copy)]
pub struct PriceChartRuntime {
    /// 심볼 목록 파라미터 키
    symbols_key: &'static str,
    /// 생성할 페이로드
    kind: ChartKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChartKind {
    Equity,
    Future,
    Crypto,
}

impl PriceChartRuntime {
    /// `tickers` 파라미터 → MarketTick.
    pub fn equities() -> Self {
        Self {
            symbols_key: "tickers",
            kind: ChartKind::Equity,
        }
    }

    /// `symbols` 파라미터 → FuturesQuote.
    pub fn futures() -> Self {
        Self {
            symbols_key: "symbols",
            kind: ChartKind::Future,
        }
    }

    /// `assets` 파라미터 → CryptoTick.
    pub fn crypto() -> Self {
        Self {
            symbols_key: "assets",
            kind: ChartKind::Crypto,
        }
    }

    fn payload(&self, bar: PriceBar) -> Payload {
        match self.kind {
            ChartKind::Equity => Payload::MarketTick(bar),
            ChartKind::Future => Payload::FuturesQuote(bar),
            ChartKind::Crypto => Payload::CryptoTick(bar),
        }
    }
}

// ==================== 응답 타입 ====================

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
    #[serde(default)]
    events: ChartEvents,
}

/// `events=div,split` 요청 시 포함되는 이벤트 (키는 epoch 초 문자열).
#[derive(Debug, Default, Deserialize)]
struct ChartEvents {
    #[serde(default)]
    dividends: HashMap<String, DividendEvent>,
    #[serde(default)]
    splits: HashMap<String, SplitEvent>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct SplitEvent {
    numerator: f64,
    denominator: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    bid: Option<f64>,
    #[serde(default)]
    ask: Option<f64>,
    #[serde(default)]
    bid_size: Option<f64>,
    #[serde(default)]
    ask_size: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

fn at(series: &[Option<f64>], i: usize) -> Option<f64> {
    series.get(i).copied().flatten()
}

/// 차트 응답을 봉 목록으로 변환합니다.
fn parse_bars(symbol: &str, response: ChartResponse) -> Result<Vec<PriceBar>, FetchError> {
    if let Some(error) = response.chart.error {
        return Err(FetchError::Permanent(format!(
            "chart error for {}: {} {}",
            symbol,
            error.code.unwrap_or_default(),
            error.description.unwrap_or_default()
        )));
    }

    let result = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| FetchError::Permanent(format!("empty chart result for {}", symbol)))?;

    let asset = result.meta.symbol.clone().unwrap_or_else(|| symbol.to_string());
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let dividends: HashMap<i64, f64> = result
        .events
        .dividends
        .values()
        .map(|d| (d.date, d.amount))
        .collect();
    let splits: HashMap<i64, f64> = result
        .events
        .splits
        .values()
        .filter(|s| s.denominator > 0.0)
        .map(|s| (s.date, s.numerator / s.denominator))
        .collect();

    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let Some(close) = at(&quote.close, i).and_then(decimal) else {
            continue;
        };
        let Some(timestamp) = Utc.timestamp_opt(*ts, 0).single() else {
            continue;
        };

        bars.push(PriceBar {
            asset: asset.clone(),
            timestamp,
            open: at(&quote.open, i).and_then(decimal),
            high: at(&quote.high, i).and_then(decimal),
            low: at(&quote.low, i).and_then(decimal),
            close: Some(close),
            volume: at(&quote.volume, i).and_then(decimal),
            currency: result.meta.currency.clone(),
            bid: result.meta.bid.and_then(decimal),
            ask: result.meta.ask.and_then(decimal),
            bid_size: result.meta.bid_size.and_then(decimal),
            ask_size: result.meta.ask_size.and_then(decimal),
            dividends: dividends.get(ts).copied().and_then(decimal),
            stock_splits: splits.get(ts).copied().and_then(decimal),
        });
    }
    Ok(bars)
}

#[async_trait]
impl CollectorRuntime for PriceChartRuntime {
    fn name(&self) -> &'static str {
        match self.kind {
            ChartKind::Equity => "equities",
            ChartKind::Future => "futures",
            ChartKind::Crypto => "crypto",
        }
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let base = base_url(spec, YAHOO_BASE);
        let range = spec.parameters.str("range").unwrap_or("1d").to_string();
        let interval = spec.parameters.str("bar_interval").unwrap_or("1d").to_string();
        let symbols = spec.parameters.string_list(self.symbols_key);

        let items = symbols.into_iter().map(|s| (s.clone(), s));
        collect_items(spec, items, |symbol| {
            let base = base.clone();
            let range = range.clone();
            let interval = interval.clone();
            async move {
                let url = endpoint(&base, &["v8", "finance", "chart", &symbol])?;
                let fetched = ctx
                    .http
                    .get_json::<ChartResponse>(url.as_str(), |r| {
                        r.query(&[
                            ("range", range.as_str()),
                            ("interval", interval.as_str()),
                            ("events", "div,split"),
                        ])
                    })
                    .await?;

                parse_bars(&symbol, fetched.body)?
                    .into_iter()
                    .map(|bar| record(spec, fetched.fetched_at, self.payload(bar)))
                    .collect()
            }
        })
        .await
    }
}
