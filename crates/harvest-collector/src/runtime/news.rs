//! 뉴스 헤드라인 스크래핑 런타임.
//!
//! 소스 페이지마다 `headlines_selector`로 헤드라인을 찾고, 링크를 절대 URL로
//! 해석합니다. `article_selector`가 있으면 기사 페이지를 받아 본문 앞 500자를
//! 요약으로 저장합니다. 캡차 페이지는 감지되어 Resilience 계층으로 전파됩니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{CollectorSpec, NewsArticle, Payload, Record};
use scraper::Html;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    collect_items, element_link, element_text, record, selector, CollectContext, CollectOutput,
    CollectorRuntime,
};
use crate::error::FetchError;

/// 요약 최대 길이 (문자)
pub const SUMMARY_MAX_CHARS: usize = 500;
const DEFAULT_MAX_HEADLINES: u64 = 50;

/// 뉴스 소스 설정.
#[derive(Debug, Clone, Deserialize)]
pub struct NewsSource {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    pub headlines_selector: String,
    #[serde(default)]
    pub article_selector: Option<String>,
}

impl NewsSource {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// 뉴스 런타임.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewsRuntime;

struct Headline {
    text: String,
    link: Option<String>,
}

fn parse_headlines(
    body: &str,
    page_url: &reqwest::Url,
    css: &str,
    limit: usize,
) -> Result<Vec<Headline>, FetchError> {
    let selector = selector(css)?;
    let document = Html::parse_document(body);

    Ok(document
        .select(&selector)
        .map(|el| Headline {
            text: element_text(el),
            link: element_link(el, page_url),
        })
        .filter(|h| !h.text.is_empty())
        .take(limit)
        .collect())
}

/// 문자 경계를 지키며 앞부분을 자릅니다.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

impl NewsRuntime {
    async fn summary(
        &self,
        ctx: &CollectContext,
        url: &str,
        css: &str,
    ) -> Result<Option<String>, FetchError> {
        let selector = selector(css)?;
        let page = ctx.http.get_page(url).await?;
        let document = Html::parse_document(&page.body);
        let text = document
            .select(&selector)
            .map(element_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Ok((!text.is_empty()).then(|| truncate_chars(&text, SUMMARY_MAX_CHARS)))
    }

    async fn collect_source(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
        source: &NewsSource,
        limit: usize,
    ) -> Result<Vec<Record>, FetchError> {
        let page = ctx.http.get_page(&source.url).await?;
        let captured_at: DateTime<Utc> = page.fetched_at;
        let headlines = parse_headlines(&page.body, &page.url, &source.headlines_selector, limit)?;

        let mut records = Vec::with_capacity(headlines.len());
        for headline in headlines {
            let summary = match (&source.article_selector, &headline.link) {
                (Some(css), Some(link)) => match self.summary(ctx, link, css).await {
                    Ok(summary) => summary,
                    Err(e) if e.escalates() => return Err(e),
                    Err(e) => {
                        warn!(collector = %spec.id, url = %link, error = %e, "Article fetch failed");
                        None
                    }
                },
                _ => None,
            };

            let article = NewsArticle {
                source: source.label().to_string(),
                headline: headline.text,
                url: headline.link,
                summary,
            };
            records.push(record(spec, captured_at, Payload::NewsArticle(article))?);
        }

        debug!(
            collector = %spec.id,
            source = source.label(),
            headlines = records.len(),
            "News source scraped"
        );
        Ok(records)
    }
}

#[async_trait]
impl CollectorRuntime for NewsRuntime {
    fn name(&self) -> &'static str {
        "news"
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let sources: Vec<NewsSource> = spec
            .parameters
            .decode("sources")
            .map_err(|e| FetchError::Permanent(format!("invalid news sources: {}", e)))?
            .unwrap_or_default();
        let limit = spec
            .parameters
            .u64("max_headlines")
            .unwrap_or(DEFAULT_MAX_HEADLINES) as usize;

        let items = sources.into_iter().map(|s| (s.label().to_string(), s));
        collect_items(spec, items, |source| async move {
            self.collect_source(spec, ctx, &source, limit).await
        })
        .await
    }
}
