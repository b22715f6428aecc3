//! 카테고리별 수집 런타임.
//!
//! 각 런타임은 [`CollectorSpec`]의 파라미터를 읽어 외부 소스를 조회하고
//! 정규화된 [`Record`]를 만들거나 타입이 있는 [`FetchError`]를 반환합니다.
//! 런타임은 스케줄 상태를 알지 못하며 재시도도 하지 않습니다.
//!
//! # 부분 실패
//!
//! 여러 항목(티커, 소스)을 조회하는 런타임은 일부 항목이 실패해도 성공한
//! 레코드와 실패 목록을 함께 반환합니다 ([`collect_items`]). 모든 항목이
//! 실패하면 가장 심각한 에러를 반환하고, 캡차/rate limit 에러는 즉시 전파합니다.

pub mod filings;
pub mod geopolitical;
pub mod macro_data;
pub mod market;
pub mod news;
pub mod options;
pub mod social;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{Category, CollectorSpec, Payload, Record};
use reqwest::Url;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use scraper::{ElementRef, Selector};
use secrecy::SecretString;
use serde::Deserialize;
use tracing::warn;

use harvest_core::{deserialize_secret, secret_from_env};

use crate::error::FetchError;
use crate::http::HttpClient;

pub use filings::{EarningsRuntime, SecFilingsRuntime};
pub use geopolitical::GeopoliticalRuntime;
pub use macro_data::{CpiRuntime, FedRatesRuntime};
pub use market::PriceChartRuntime;
pub use news::NewsRuntime;
pub use options::OptionsRuntime;
pub use social::{RedditRuntime, TwitterRuntime};

/// 외부 API 자격 증명.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    /// Twitter API v2 bearer token
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub twitter_bearer_token: Option<SecretString>,
    /// BLS API 키
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub bls_api_key: Option<SecretString>,
}

impl Credentials {
    /// 설정에 없는 값은 환경 변수(`TWITTER_BEARER_TOKEN`, `BLS_API_KEY`)로 채웁니다.
    pub fn with_env_fallback(mut self) -> Self {
        if self.twitter_bearer_token.is_none() {
            self.twitter_bearer_token = secret_from_env("TWITTER_BEARER_TOKEN");
        }
        if self.bls_api_key.is_none() {
            self.bls_api_key = secret_from_env("BLS_API_KEY");
        }
        self
    }
}

/// 런타임 실행 컨텍스트.
#[derive(Clone)]
pub struct CollectContext {
    pub http: HttpClient,
    pub credentials: Arc<Credentials>,
}

impl CollectContext {
    pub fn new(http: HttpClient, credentials: Credentials) -> Self {
        Self {
            http,
            credentials: Arc::new(credentials),
        }
    }

    /// 캡차 해결 토큰을 싣는 컨텍스트.
    pub fn with_captcha_token(&self, token: &str) -> Self {
        Self {
            http: self.http.with_captcha_token(token),
            credentials: self.credentials.clone(),
        }
    }
}

/// 런타임 실행 결과.
#[derive(Debug, Default)]
pub struct CollectOutput {
    pub records: Vec<Record>,
    /// 실패한 항목 (`"<항목>: <에러>"`)
    pub failures: Vec<String>,
}

impl CollectOutput {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            failures: Vec::new(),
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// 수집 런타임.
#[async_trait]
pub trait CollectorRuntime: Send + Sync {
    /// 런타임 이름 (로그용).
    fn name(&self) -> &'static str;

    /// 한 번의 수집을 실행합니다.
    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError>;
}

/// 여러 항목을 순서대로 조회하고 부분 실패를 합칩니다.
pub async fn collect_items<T, F, Fut>(
    spec: &CollectorSpec,
    items: impl IntoIterator<Item = (String, T)>,
    mut fetch: F,
) -> Result<CollectOutput, FetchError>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<Vec<Record>, FetchError>>,
{
    let mut output = CollectOutput::default();
    let mut errors: Vec<FetchError> = Vec::new();

    for (label, item) in items {
        match fetch(item).await {
            Ok(records) => output.records.extend(records),
            Err(e) if e.escalates() => return Err(e),
            Err(e) => {
                warn!(collector = %spec.id, item = %label, error = %e, "Item fetch failed");
                output.failures.push(format!("{}: {}", label, e));
                errors.push(e);
            }
        }
    }

    if output.records.is_empty() && !errors.is_empty() {
        // 전부 실패: 하나라도 일시적이면 재시도 대상
        let worst = errors.iter().position(FetchError::is_retryable).unwrap_or(0);
        return Err(errors.swap_remove(worst));
    }

    Ok(output)
}

/// 레코드 생성 헬퍼.
pub fn record(
    spec: &CollectorSpec,
    captured_at: DateTime<Utc>,
    payload: Payload,
) -> Result<Record, FetchError> {
    Ok(Record::new(&spec.id, spec.category, captured_at, payload)?)
}

/// 파라미터의 `base_url` 또는 기본 엔드포인트.
pub fn base_url(spec: &CollectorSpec, default: &str) -> String {
    spec.parameters
        .str("base_url")
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

/// 기준 URL 뒤에 경로 세그먼트를 인코딩하여 붙입니다.
pub fn endpoint(base: &str, segments: &[&str]) -> Result<Url, FetchError> {
    let mut url = Url::parse(base)
        .map_err(|e| FetchError::Permanent(format!("invalid base url '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| FetchError::Permanent(format!("base url cannot have a path: {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// 유한한 f64만 Decimal로 변환합니다.
pub fn decimal(value: f64) -> Option<Decimal> {
    if value.is_finite() {
        Decimal::from_f64(value).map(|d| d.normalize())
    } else {
        None
    }
}

/// CSS 셀렉터 파싱. 잘못된 셀렉터는 설정 문제이므로 Permanent.
pub fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::Permanent(format!("invalid selector '{}': {}", css, e)))
}

/// 요소의 텍스트를 공백 정리하여 반환합니다.
pub fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// 요소 자체 또는 첫 하위 `a[href]`의 링크를 기준 URL로 해석합니다.
pub fn element_link(element: ElementRef<'_>, base: &Url) -> Option<String> {
    let href = element.value().attr("href").or_else(|| {
        let anchor = Selector::parse("a[href]").ok()?;
        element.select(&anchor).next()?.value().attr("href")
    })?;
    base.join(href.trim()).ok().map(|u| u.to_string())
}

/// 카테고리별 런타임 집합.
#[derive(Clone, Default)]
pub struct RuntimeSet {
    runtimes: HashMap<Category, Arc<dyn CollectorRuntime>>,
}

impl RuntimeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 모든 카테고리의 기본 런타임.
    pub fn standard() -> Self {
        let mut set = Self::new();
        set.register(Category::Equities, Arc::new(PriceChartRuntime::equities()));
        set.register(Category::Futures, Arc::new(PriceChartRuntime::futures()));
        set.register(Category::Crypto, Arc::new(PriceChartRuntime::crypto()));
        set.register(Category::Options, Arc::new(OptionsRuntime));
        set.register(Category::News, Arc::new(NewsRuntime));
        set.register(Category::Twitter, Arc::new(TwitterRuntime));
        set.register(Category::Reddit, Arc::new(RedditRuntime));
        set.register(Category::SecFilings, Arc::new(SecFilingsRuntime));
        set.register(Category::EarningsCalls, Arc::new(EarningsRuntime));
        set.register(Category::FedRates, Arc::new(FedRatesRuntime));
        set.register(Category::Cpi, Arc::new(CpiRuntime));
        set.register(Category::Geopolitical, Arc::new(GeopoliticalRuntime));
        set
    }

    /// 런타임을 등록합니다 (같은 카테고리는 교체).
    pub fn register(&mut self, category: Category, runtime: Arc<dyn CollectorRuntime>) {
        self.runtimes.insert(category, runtime);
    }

    pub fn get(&self, category: Category) -> Option<Arc<dyn CollectorRuntime>> {
        self.runtimes.get(&category).cloned()
    }
}
