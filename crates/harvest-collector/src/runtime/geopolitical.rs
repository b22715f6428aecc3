//! 지정학 이벤트 스크래핑 런타임.
//!
//! 소스 페이지에서 `event_selector`로 이벤트 블록을 찾고, 블록 안에서
//! 제목/날짜/설명을 하위 셀렉터로 추출합니다. 날짜는 `YYYY-MM-DD` 또는
//! `DD-MM-YYYY`만 허용하며, 날짜를 해석할 수 없거나 제목이 없는 이벤트는
//! 경고를 남기고 건너뜁니다.

use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_core::{CollectorSpec, GeopoliticalEvent, Payload, Record};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::warn;

use super::{
    collect_items, element_text, record, selector, CollectContext, CollectOutput, CollectorRuntime,
};
use crate::error::FetchError;

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d-%m-%Y"];

/// 이벤트 소스 설정.
#[derive(Debug, Clone, Deserialize)]
pub struct EventSource {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    pub event_selector: String,
    pub title_selector: String,
    pub date_selector: String,
    #[serde(default)]
    pub description_selector: Option<String>,
}

impl EventSource {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// 지정학 이벤트 런타임.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeopoliticalRuntime;

pub fn parse_event_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

fn parse_events(
    collector_id: &str,
    source: &EventSource,
    body: &str,
) -> Result<Vec<GeopoliticalEvent>, FetchError> {
    let events = selector(&source.event_selector)?;
    let title_sel = selector(&source.title_selector)?;
    let date_sel = selector(&source.date_selector)?;
    let description_sel = source
        .description_selector
        .as_deref()
        .map(selector)
        .transpose()?;

    let document = Html::parse_document(body);
    let mut parsed = Vec::new();
    for event in document.select(&events) {
        let Some(title) = first_text(event, &title_sel) else {
            warn!(collector = collector_id, source = source.label(), "Event without title skipped");
            continue;
        };
        let raw_date = first_text(event, &date_sel).unwrap_or_default();
        let Some(event_date) = parse_event_date(&raw_date) else {
            warn!(
                collector = collector_id,
                source = source.label(),
                title = %title,
                date = %raw_date,
                "Event date unparseable, skipped"
            );
            continue;
        };

        parsed.push(GeopoliticalEvent {
            source: source.label().to_string(),
            title,
            event_date,
            description: description_sel.as_ref().and_then(|d| first_text(event, d)),
        });
    }
    Ok(parsed)
}

impl GeopoliticalRuntime {
    async fn collect_source(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
        source: &EventSource,
    ) -> Result<Vec<Record>, FetchError> {
        let page = ctx.http.get_page(&source.url).await?;
        parse_events(&spec.id, source, &page.body)?
            .into_iter()
            .map(|e| record(spec, page.fetched_at, Payload::GeopoliticalEvent(e)))
            .collect()
    }
}

#[async_trait]
impl CollectorRuntime for GeopoliticalRuntime {
    fn name(&self) -> &'static str {
        "geopolitical"
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let sources: Vec<EventSource> = spec
            .parameters
            .decode("sources")
            .map_err(|e| FetchError::Permanent(format!("invalid event sources: {}", e)))?
            .unwrap_or_default();

        let items = sources.into_iter().map(|s| (s.label().to_string(), s));
        collect_items(spec, items, |source| async move {
            self.collect_source(spec, ctx, &source).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::{context, spec};
    use harvest_core::Category;
    use serde_json::json;

    const EVENTS_PAGE: &str = r#"
        <div class="event">
          <h4>Border talks resume</h4><span class="date">2024-03-05</span>
          <p>Delegations met in Geneva.</p>
        </div>
        <div class="event">
          <h4>Sanctions extended</h4><span class="date">06-03-2024</span>
        </div>
        <div class="event">
          <h4>Undated rumor</h4><span class="date">sometime in March</span>
        </div>
        <div class="event"><span class="date">2024-03-07</span></div>
    "#;

    #[test]
    fn test_parse_event_date_formats() {
        assert_eq!(parse_event_date("2024-03-05"), NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(parse_event_date(" 06-03-2024 "), NaiveDate::from_ymd_opt(2024, 3, 6));
        assert!(parse_event_date("March 6, 2024").is_none());
    }

    #[tokio::test]
    async fn test_events_with_bad_dates_are_dropped() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/events")
            .with_body(EVENTS_PAGE)
            .create_async()
            .await;

        let spec = spec(
            "macro_data.geopolitical",
            Category::Geopolitical,
            json!({ "sources": [{
                "url": format!("{}/events", server.url()),
                "name": "Wire",
                "event_selector": "div.event",
                "title_selector": "h4",
                "date_selector": "span.date",
                "description_selector": "p"
            }] }),
        );
        let output = GeopoliticalRuntime.execute(&spec, &context()).await.unwrap();

        assert_eq!(output.records.len(), 2);
        assert!(!output.is_partial());
        match &output.records[0].payload {
            Payload::GeopoliticalEvent(e) => {
                assert_eq!(e.title, "Border talks resume");
                assert_eq!(e.description.as_deref(), Some("Delegations met in Geneva."));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        match &output.records[1].payload {
            Payload::GeopoliticalEvent(e) => assert!(e.description.is_none()),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_selector_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/events")
            .with_body(EVENTS_PAGE)
            .create_async()
            .await;

        let spec = spec(
            "macro_data.geopolitical",
            Category::Geopolitical,
            json!({ "sources": [{
                "url": format!("{}/events", server.url()),
                "event_selector": "div[[",
                "title_selector": "h4",
                "date_selector": "span"
            }] }),
        );
        let err = GeopoliticalRuntime.execute(&spec, &context()).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent(_)));
    }
}
