//! 거시경제 지표 런타임 (연준 금리, CPI).

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use harvest_core::{CollectorSpec, MacroObservation, Payload};
use quick_xml::events::Event;
use quick_xml::Reader;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{base_url, endpoint, record, CollectContext, CollectOutput, CollectorRuntime};
use crate::error::FetchError;

// ==================== 연준 H.15 ====================

const FED_BASE: &str = "https://www.federalreserve.gov";
const FED_FUNDS_INDICATOR: &str = "fed_funds_target_upper";
const FED_FUNDS_SERIES: &str = "FEDFUNDS_TARGET_UPPER";

/// 연준 H.15 RSS 피드 런타임.
///
/// 첫 번째 `item`(최신)의 `dc:date`와
/// `fed:rates/fed:fedfunds/fed:target_range_upper_limit` 값을 읽습니다.
#[derive(Debug, Clone, Copy, Default)]
pub struct FedRatesRuntime;

#[derive(Debug, PartialEq)]
struct FedFundsTarget {
    date: NaiveDate,
    upper: Decimal,
}

const TARGET_PATH: [&str; 3] = ["rates", "fedfunds", "target_range_upper_limit"];

/// 피드의 최신 항목을 파싱합니다. 네임스페이스 접두사는 무시합니다.
fn parse_h15(xml: &str) -> Result<FedFundsTarget, FetchError> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut date: Option<String> = None;
    let mut upper: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                if path.pop().as_deref() == Some("item") {
                    // 첫 item만 사용
                    break;
                }
            }
            Ok(Event::Text(t)) => {
                let Some(item_at) = path.iter().position(|p| p == "item") else {
                    continue;
                };
                let text = t
                    .unescape()
                    .map_err(|e| FetchError::Permanent(format!("h15 feed text: {}", e)))?
                    .trim()
                    .to_string();
                let inner = path[item_at + 1..].iter().map(String::as_str);
                if inner.clone().eq(["date"]) {
                    date = Some(text);
                } else if inner.eq(TARGET_PATH) {
                    upper = Some(text);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(FetchError::Permanent(format!(
                    "h15 feed is not valid xml at {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    let date = date.ok_or_else(|| FetchError::Permanent("h15 feed has no dated item".to_string()))?;
    let date = NaiveDate::parse_from_str(date.get(..10).unwrap_or(&date), "%Y-%m-%d")
        .map_err(|e| FetchError::Permanent(format!("h15 item date '{}': {}", date, e)))?;
    let upper = upper.ok_or_else(|| {
        FetchError::Permanent("fed funds target upper limit not found in h15 feed".to_string())
    })?;
    let upper = Decimal::from_str(&upper)
        .map_err(|e| FetchError::Permanent(format!("fed funds target '{}': {}", upper, e)))?;

    Ok(FedFundsTarget { date, upper })
}

#[async_trait]
impl CollectorRuntime for FedRatesRuntime {
    fn name(&self) -> &'static str {
        "fed_rates"
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let url = endpoint(&base_url(spec, FED_BASE), &["feeds", "h15.xml"])?;
        let feed = ctx.http.get_text(url.as_str()).await?;
        let target = parse_h15(&feed.body)?;

        info!(collector = %spec.id, date = %target.date, upper = %target.upper, "연준 금리 수집");
        let observation = MacroObservation {
            indicator: FED_FUNDS_INDICATOR.to_string(),
            series_id: FED_FUNDS_SERIES.to_string(),
            observation_date: target.date,
            value: target.upper,
            period: None,
        };
        Ok(CollectOutput::new(vec![record(
            spec,
            feed.fetched_at,
            Payload::MacroObservation(observation),
        )?]))
    }
}

// ==================== BLS CPI ====================

const BLS_BASE: &str = "https://api.bls.gov";
const DEFAULT_CPI_SERIES: &str = "CUUR0000SA0";

/// BLS CPI 런타임.
///
/// 올해와 작년 데이터를 요청하고 가장 최근 월간 관측치를 저장합니다.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpiRuntime;

#[derive(Debug, Deserialize)]
struct BlsResponse {
    status: String,
    #[serde(default)]
    message: Vec<String>,
    #[serde(rename = "Results", default)]
    results: Option<BlsResults>,
}

#[derive(Debug, Deserialize)]
struct BlsResults {
    #[serde(default)]
    series: Vec<BlsSeries>,
}

#[derive(Debug, Deserialize)]
struct BlsSeries {
    #[serde(default)]
    data: Vec<BlsPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlsPoint {
    year: String,
    period: String,
    #[serde(default)]
    period_name: Option<String>,
    value: String,
}

impl BlsPoint {
    /// `M01`~`M12` 월간 관측치의 기준일 (해당 월 1일). 연평균(`M13`)은 None.
    fn month_start(&self) -> Option<NaiveDate> {
        let year: i32 = self.year.trim().parse().ok()?;
        let month: u32 = self.period.strip_prefix('M')?.parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, 1)
    }
}

fn latest_cpi(series_id: &str, response: BlsResponse) -> Result<MacroObservation, FetchError> {
    if response.status != "REQUEST_SUCCEEDED" {
        return Err(FetchError::Permanent(format!(
            "BLS request failed ({}): {}",
            response.status,
            response.message.join("; ")
        )));
    }

    // 데이터는 최신순
    let (point, date) = response
        .results
        .and_then(|r| r.series.into_iter().next())
        .map(|s| s.data)
        .unwrap_or_default()
        .into_iter()
        .find_map(|p| p.month_start().map(|d| (p, d)))
        .ok_or_else(|| FetchError::Permanent(format!("no CPI data for {}", series_id)))?;

    let value = Decimal::from_str(point.value.trim())
        .map_err(|e| FetchError::Permanent(format!("CPI value '{}': {}", point.value, e)))?;

    Ok(MacroObservation {
        indicator: "cpi".to_string(),
        series_id: series_id.to_string(),
        observation_date: date,
        value,
        period: point.period_name.or(Some(point.period)),
    })
}

#[async_trait]
impl CollectorRuntime for CpiRuntime {
    fn name(&self) -> &'static str {
        "cpi"
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let series_id = spec
            .parameters
            .str("series_id")
            .unwrap_or(DEFAULT_CPI_SERIES)
            .to_string();
        let api_key = spec.parameters.str("api_key").map(str::to_string).or_else(|| {
            ctx.credentials
                .bls_api_key
                .as_ref()
                .map(|k| k.expose_secret().to_string())
        });

        let year = Utc::now().year();
        let mut body = json!({
            "seriesid": [series_id],
            "startyear": (year - 1).to_string(),
            "endyear": year.to_string(),
        });
        if let Some(key) = api_key {
            body["registrationkey"] = json!(key);
        }

        let url = endpoint(
            &base_url(spec, BLS_BASE),
            &["publicAPI", "v2", "timeseries", "data", ""],
        )?;
        let fetched = ctx.http.post_json::<_, BlsResponse>(url.as_str(), &body).await?;
        let observation = latest_cpi(&series_id, fetched.body)?;

        info!(
            collector = %spec.id,
            date = %observation.observation_date,
            value = %observation.value,
            "CPI 수집"
        );
        Ok(CollectOutput::new(vec![record(
            spec,
            fetched.fetched_at,
            Payload::MacroObservation(observation),
        )?]))
    }
}
