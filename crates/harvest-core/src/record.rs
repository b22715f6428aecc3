//! 정규화된 수집 레코드.
//!
//! 서로 다른 형태의 원천 데이터를 하나의 태그된 페이로드 집합으로 정규화합니다.
//! 레코드는 런타임이 만들고, 저장소에 넘겨진 뒤 메모리에서 사라집니다.
//!
//! # Natural key
//!
//! 모든 레코드는 내용에서 결정적으로 유도되는 `natural_key`를 가지며,
//! 저장소는 이 키로 중복을 제거합니다 (last-write-wins).

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RecordError;
use crate::spec::Category;

/// 가격 막대 (주식/선물/암호화폐 공통).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    /// 티커/심볼
    pub asset: String,
    /// 막대 시각
    pub timestamp: DateTime<Utc>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub currency: Option<String>,
    /// 호가 근사치 (제공되는 경우)
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    #[serde(default)]
    pub bid_size: Option<Decimal>,
    #[serde(default)]
    pub ask_size: Option<Decimal>,
    /// 막대 시각에 지급된 주당 배당금
    #[serde(default)]
    pub dividends: Option<Decimal>,
    /// 막대 시각의 주식 분할 비율 (2:1 → 2)
    #[serde(default)]
    pub stock_splits: Option<Decimal>,
}

/// 옵션 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

/// 옵션 호가.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionQuote {
    pub underlying: String,
    pub contract_symbol: String,
    pub option_type: OptionType,
    pub expiration: DateTime<Utc>,
    pub strike: Decimal,
    pub last_price: Option<Decimal>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub volume: Option<u64>,
    pub open_interest: Option<u64>,
    pub implied_volatility: Option<f64>,
    pub in_the_money: Option<bool>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

/// 뉴스 헤드라인.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    /// 뉴스 소스 이름
    pub source: String,
    pub headline: String,
    /// 기사 절대 URL
    pub url: Option<String>,
    /// 본문 요약 (최대 500자)
    pub summary: Option<String>,
}

/// 소셜 플랫폼.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Twitter,
    Reddit,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::Reddit => "reddit",
        }
    }
}

/// 소셜 게시물 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostKind {
    Tweet,
    Post,
    Comment,
}

/// 소셜 게시물 (트윗, 레딧 게시물/댓글).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialPost {
    pub platform: Platform,
    pub post_kind: PostKind,
    pub post_id: String,
    /// 댓글인 경우 원 게시물 id
    pub parent_id: Option<String>,
    pub author: Option<String>,
    /// 계정 또는 서브레딧
    pub channel: String,
    pub title: Option<String>,
    pub content: String,
    pub score: Option<i64>,
    pub reply_count: Option<u64>,
    pub url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

/// 공시 참조 (SEC EDGAR).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingReference {
    pub cik: String,
    pub filing_type: String,
    pub filing_date: Option<NaiveDate>,
    pub accession_number: String,
    pub url: String,
}

/// 실적 발표 녹취록 참조.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsTranscriptRef {
    pub company: String,
    pub title: String,
    pub url: String,
    /// 페이지에 표시된 발표일 (원문 그대로)
    pub call_date: Option<String>,
}

/// 거시 지표 관측값.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroObservation {
    /// 지표 이름 (예: "cpi", "fed_funds_target_upper")
    pub indicator: String,
    pub series_id: String,
    pub observation_date: NaiveDate,
    pub value: Decimal,
    /// 원천의 기간 표기 (예: "M09")
    pub period: Option<String>,
}

/// 지정학 이벤트.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeopoliticalEvent {
    pub source: String,
    pub title: String,
    pub event_date: NaiveDate,
    pub description: Option<String>,
}

/// 레코드 페이로드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    MarketTick(PriceBar),
    OptionQuote(OptionQuote),
    FuturesQuote(PriceBar),
    CryptoTick(PriceBar),
    NewsArticle(NewsArticle),
    SocialPost(SocialPost),
    FilingReference(FilingReference),
    EarningsTranscriptRef(EarningsTranscriptRef),
    MacroObservation(MacroObservation),
    GeopoliticalEvent(GeopoliticalEvent),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::MarketTick(_) => "market_tick",
            Payload::OptionQuote(_) => "option_quote",
            Payload::FuturesQuote(_) => "futures_quote",
            Payload::CryptoTick(_) => "crypto_tick",
            Payload::NewsArticle(_) => "news_article",
            Payload::SocialPost(_) => "social_post",
            Payload::FilingReference(_) => "filing_reference",
            Payload::EarningsTranscriptRef(_) => "earnings_transcript_ref",
            Payload::MacroObservation(_) => "macro_observation",
            Payload::GeopoliticalEvent(_) => "geopolitical_event",
        }
    }

    /// 내용에서 natural key를 유도합니다.
    ///
    /// 키를 구성하는 필드가 비어 있으면 `None`.
    pub fn natural_key(&self) -> Option<String> {
        let kind = self.kind();
        match self {
            Payload::MarketTick(bar) | Payload::FuturesQuote(bar) | Payload::CryptoTick(bar) => {
                non_empty(&bar.asset)
                    .map(|asset| format!("{}:{}:{}", kind, asset, bar.timestamp.timestamp()))
            }
            Payload::OptionQuote(q) => non_empty(&q.contract_symbol).map(|contract| {
                match q.last_trade_at {
                    Some(ts) => format!("{}:{}:{}", kind, contract, ts.timestamp()),
                    None => format!("{}:{}", kind, contract),
                }
            }),
            Payload::NewsArticle(a) => match a.url.as_deref().and_then(non_empty) {
                Some(url) => Some(url.to_string()),
                None => non_empty(&a.headline)
                    .map(|headline| format!("{}:{}", kind, content_hash(&[&a.source, headline]))),
            },
            Payload::SocialPost(p) => non_empty(&p.post_id)
                .map(|id| format!("{}:{}:{}", kind, p.platform.as_str(), id)),
            Payload::FilingReference(f) => {
                non_empty(&f.accession_number).map(|acc| format!("{}:{}", kind, acc))
            }
            Payload::EarningsTranscriptRef(t) => non_empty(&t.url).map(str::to_string),
            Payload::MacroObservation(m) => non_empty(&m.series_id)
                .map(|series| format!("{}:{}:{}", kind, series, m.observation_date)),
            Payload::GeopoliticalEvent(e) => non_empty(&e.title).map(|title| {
                let date = e.event_date.to_string();
                format!("{}:{}", kind, content_hash(&[&e.source, &date, title]))
            }),
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// 여러 필드를 이어 붙인 SHA-256 해시 (hex).
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// 정규화된 레코드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// 레코드를 만든 collector id
    pub source_collector_id: String,
    pub category: Category,
    /// 원천 응답을 받은 시각
    pub captured_at: DateTime<Utc>,
    /// 중복 제거 키 (비어 있지 않음)
    pub natural_key: String,
    pub payload: Payload,
}

impl Record {
    /// 페이로드에서 natural key를 유도해 레코드를 생성합니다.
    pub fn new(
        source_collector_id: impl Into<String>,
        category: Category,
        captured_at: DateTime<Utc>,
        payload: Payload,
    ) -> Result<Self, RecordError> {
        let natural_key = payload
            .natural_key()
            .ok_or(RecordError::EmptyNaturalKey {
                kind: payload.kind(),
            })?;

        Ok(Self {
            source_collector_id: source_collector_id.into(),
            category,
            captured_at,
            natural_key,
            payload,
        })
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}
