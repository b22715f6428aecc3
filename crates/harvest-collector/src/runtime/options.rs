//! 옵션 체인 런타임.
//!
//! Yahoo Finance v7 options 엔드포인트에서 기초자산별로 가까운 만기부터
//! `max_expirations`개(기본 3)의 콜/풋 체인을 수집합니다.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use harvest_core::{CollectorSpec, OptionQuote, OptionType, Payload, Record};
use serde::Deserialize;
use tracing::debug;

use super::{
    base_url, collect_items, decimal, endpoint, record, CollectContext, CollectOutput,
    CollectorRuntime,
};
use crate::error::FetchError;

const YAHOO_BASE: &str = "https://query1.finance.yahoo.com";
const DEFAULT_MAX_EXPIRATIONS: u64 = 3;

/// 옵션 런타임.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionsRuntime;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionsResponse {
    option_chain: OptionChain,
}

#[derive(Debug, Deserialize)]
struct OptionChain {
    #[serde(default)]
    result: Vec<ChainResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainResult {
    #[serde(default)]
    underlying_symbol: Option<String>,
    #[serde(default)]
    expiration_dates: Vec<i64>,
    #[serde(default)]
    options: Vec<ExpirySlice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpirySlice {
    expiration_date: i64,
    #[serde(default)]
    calls: Vec<Contract>,
    #[serde(default)]
    puts: Vec<Contract>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Contract {
    contract_symbol: String,
    strike: f64,
    #[serde(default)]
    last_price: Option<f64>,
    #[serde(default)]
    bid: Option<f64>,
    #[serde(default)]
    ask: Option<f64>,
    #[serde(default)]
    volume: Option<u64>,
    #[serde(default)]
    open_interest: Option<u64>,
    #[serde(default)]
    implied_volatility: Option<f64>,
    #[serde(default)]
    in_the_money: Option<bool>,
    #[serde(default)]
    last_trade_date: Option<i64>,
}

fn unix(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

impl Contract {
    fn into_quote(
        self,
        underlying: &str,
        option_type: OptionType,
        expiration: DateTime<Utc>,
    ) -> Option<OptionQuote> {
        Some(OptionQuote {
            underlying: underlying.to_string(),
            strike: decimal(self.strike)?,
            contract_symbol: self.contract_symbol,
            option_type,
            expiration,
            last_price: self.last_price.and_then(decimal),
            bid: self.bid.and_then(decimal),
            ask: self.ask.and_then(decimal),
            volume: self.volume,
            open_interest: self.open_interest,
            implied_volatility: self.implied_volatility.filter(|v| v.is_finite()),
            in_the_money: self.in_the_money,
            last_trade_at: self.last_trade_date.and_then(unix),
        })
    }
}

impl ChainResult {
    fn into_quotes(self, fallback_underlying: &str) -> Vec<OptionQuote> {
        let underlying = self
            .underlying_symbol
            .unwrap_or_else(|| fallback_underlying.to_string());

        let mut quotes = Vec::new();
        for slice in self.options {
            let Some(expiration) = unix(slice.expiration_date) else {
                continue;
            };
            let calls = slice.calls.into_iter().map(|c| (c, OptionType::Call));
            let puts = slice.puts.into_iter().map(|c| (c, OptionType::Put));
            quotes.extend(
                calls
                    .chain(puts)
                    .filter_map(|(c, t)| c.into_quote(&underlying, t, expiration)),
            );
        }
        quotes
    }
}

impl OptionsRuntime {
    async fn fetch_chain(
        &self,
        ctx: &CollectContext,
        base: &str,
        underlying: &str,
        date: Option<i64>,
    ) -> Result<(ChainResult, DateTime<Utc>), FetchError> {
        let url = endpoint(base, &["v7", "finance", "options", underlying])?;
        let fetched = ctx
            .http
            .get_json::<OptionsResponse>(url.as_str(), |r| match date {
                Some(date) => r.query(&[("date", date)]),
                None => r,
            })
            .await?;

        if let Some(error) = fetched.body.option_chain.error.filter(|e| !e.is_null()) {
            return Err(FetchError::Permanent(format!(
                "options error for {}: {}",
                underlying, error
            )));
        }
        let chain = fetched
            .body
            .option_chain
            .result
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::Permanent(format!("empty option chain for {}", underlying)))?;
        Ok((chain, fetched.fetched_at))
    }

    async fn collect_underlying(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
        base: &str,
        underlying: &str,
        max_expirations: usize,
    ) -> Result<Vec<Record>, FetchError> {
        // 첫 응답에 가장 가까운 만기 체인이 포함됨
        let (first, fetched_at) = self.fetch_chain(ctx, base, underlying, None).await?;
        let mut dates = first.expiration_dates.clone();
        dates.sort_unstable();
        let covered: Vec<i64> = first.options.iter().map(|o| o.expiration_date).collect();

        let mut records = Vec::new();
        let mut seen = covered.len();
        for quote in first.into_quotes(underlying) {
            records.push(record(spec, fetched_at, Payload::OptionQuote(quote))?);
        }

        for date in dates.into_iter().filter(|d| !covered.contains(d)) {
            if seen >= max_expirations {
                break;
            }
            let (chain, fetched_at) = self.fetch_chain(ctx, base, underlying, Some(date)).await?;
            for quote in chain.into_quotes(underlying) {
                records.push(record(spec, fetched_at, Payload::OptionQuote(quote))?);
            }
            seen += 1;
        }

        debug!(
            collector = %spec.id,
            underlying,
            expirations = seen,
            records = records.len(),
            "Option chain collected"
        );
        Ok(records)
    }
}

#[async_trait]
impl CollectorRuntime for OptionsRuntime {
    fn name(&self) -> &'static str {
        "options"
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let base = base_url(spec, YAHOO_BASE);
        let max_expirations = spec
            .parameters
            .u64("max_expirations")
            .unwrap_or(DEFAULT_MAX_EXPIRATIONS)
            .max(1) as usize;

        let underlyings = spec.parameters.string_list("underlyings");
        let items = underlyings.into_iter().map(|u| (u.clone(), u));
        collect_items(spec, items, |underlying| {
            let base = base.clone();
            async move {
                self.collect_underlying(spec, ctx, &base, &underlying, max_expirations)
                    .await
            }
        })
        .await
    }
}
