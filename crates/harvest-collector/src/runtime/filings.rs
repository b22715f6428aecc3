//! 공시 런타임 (SEC EDGAR, 실적 발표 트랜스크립트).

use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_core::{CollectorSpec, EarningsTranscriptRef, FilingReference, Payload, Record};
use reqwest::Url;
use scraper::{ElementRef, Html};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    base_url, collect_items, element_link, element_text, endpoint, record, selector,
    CollectContext, CollectOutput, CollectorRuntime,
};
use crate::error::FetchError;

const EDGAR_BASE: &str = "https://www.sec.gov";
const DEFAULT_FILING_TYPES: &str = "10-K,10-Q";
const EDGAR_ROWS: &str = "40";

// ==================== SEC EDGAR ====================

/// EDGAR 회사별 공시 목록 런타임.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecFilingsRuntime;

/// CIK를 10자리로 0 패딩합니다.
pub fn pad_cik(cik: &str) -> Result<String, FetchError> {
    let digits = cik.trim();
    if digits.is_empty() || digits.len() > 10 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(FetchError::Permanent(format!("invalid CIK '{}'", cik)));
    }
    Ok(format!("{:0>10}", digits))
}

/// 설명 칸의 `Acc-no: XXXXXXXXXX-YY-ZZZZZZ`에서 접수 번호를 꺼냅니다.
fn accession_number(description: &str) -> Option<String> {
    let rest = &description[description.find("Acc-no:")? + "Acc-no:".len()..];
    let acc: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    (!acc.is_empty()).then_some(acc)
}

fn parse_filings(cik: &str, body: &str, page_url: &Url) -> Result<Vec<FilingReference>, FetchError> {
    let rows = selector("table.tableFile2 tr")?;
    let cells = selector("td")?;
    let documents = selector("a#documentsbutton")?;
    let document = Html::parse_document(body);

    let mut filings = Vec::new();
    for row in document.select(&rows) {
        let tds: Vec<ElementRef<'_>> = row.select(&cells).collect();
        // 헤더 행은 td가 없음
        if tds.len() < 4 {
            continue;
        }

        let Some(accession) = accession_number(&element_text(tds[2])) else {
            continue;
        };
        let url = tds[1]
            .select(&documents)
            .next()
            .and_then(|a| element_link(a, page_url))
            .unwrap_or_else(|| page_url.to_string());

        filings.push(FilingReference {
            cik: cik.to_string(),
            filing_type: element_text(tds[0]),
            filing_date: NaiveDate::parse_from_str(&element_text(tds[3]), "%Y-%m-%d").ok(),
            accession_number: accession,
            url,
        });
    }
    Ok(filings)
}

#[async_trait]
impl CollectorRuntime for SecFilingsRuntime {
    fn name(&self) -> &'static str {
        "sec_filings"
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let base = base_url(spec, EDGAR_BASE);
        let types = spec
            .parameters
            .str("filing_types")
            .unwrap_or(DEFAULT_FILING_TYPES)
            .to_string();

        let ciks = spec.parameters.string_list("company_ciks");
        let items = ciks.into_iter().map(|c| (c.clone(), c));

        collect_items(spec, items, |cik| {
            let base = base.clone();
            let types = types.clone();
            async move {
                let cik = pad_cik(&cik)?;
                let mut url = endpoint(&base, &["cgi-bin", "browse-edgar"])?;
                url.query_pairs_mut()
                    .append_pair("action", "getcompany")
                    .append_pair("CIK", &cik)
                    .append_pair("type", &types)
                    .append_pair("dateb", "")
                    .append_pair("owner", "exclude")
                    .append_pair("count", EDGAR_ROWS);

                let page = ctx.http.get_page(url.as_str()).await?;
                let filings = parse_filings(&cik, &page.body, &page.url)?;
                debug!(collector = %spec.id, cik = %cik, filings = filings.len(), "EDGAR filings parsed");

                filings
                    .into_iter()
                    .map(|f| record(spec, page.fetched_at, Payload::FilingReference(f)))
                    .collect()
            }
        })
        .await
    }
}

// ==================== 실적 발표 ====================

/// 실적 발표 트랜스크립트 링크 런타임.
#[derive(Debug, Clone, Copy, Default)]
pub struct EarningsRuntime;

/// 회사별 트랜스크립트 페이지 설정.
#[derive(Debug, Clone, Deserialize)]
pub struct EarningsCompany {
    pub name: String,
    pub url: String,
    pub transcript_selector: String,
    #[serde(default)]
    pub date_selector: Option<String>,
}

impl EarningsRuntime {
    async fn call_date(
        &self,
        ctx: &CollectContext,
        url: &str,
        css: &str,
    ) -> Result<Option<String>, FetchError> {
        let selector = selector(css)?;
        let page = ctx.http.get_page(url).await?;
        let document = Html::parse_document(&page.body);
        Ok(document
            .select(&selector)
            .map(element_text)
            .find(|t| !t.is_empty()))
    }

    async fn collect_company(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
        company: &EarningsCompany,
    ) -> Result<Vec<Record>, FetchError> {
        let page = ctx.http.get_page(&company.url).await?;
        let links: Vec<(String, String)> = {
            let selector = selector(&company.transcript_selector)?;
            let document = Html::parse_document(&page.body);
            document
                .select(&selector)
                .filter_map(|el| Some((element_text(el), element_link(el, &page.url)?)))
                .filter(|(title, _)| !title.is_empty())
                .collect()
        };

        let mut records = Vec::with_capacity(links.len());
        for (title, url) in links {
            let call_date = match &company.date_selector {
                Some(css) => match self.call_date(ctx, &url, css).await {
                    Ok(date) => date,
                    Err(e) if e.escalates() => return Err(e),
                    Err(e) => {
                        warn!(collector = %spec.id, url = %url, error = %e, "Transcript date fetch failed");
                        None
                    }
                },
                None => None,
            };

            let transcript = EarningsTranscriptRef {
                company: company.name.clone(),
                title,
                url,
                call_date,
            };
            records.push(record(
                spec,
                page.fetched_at,
                Payload::EarningsTranscriptRef(transcript),
            )?);
        }
        Ok(records)
    }
}

#[async_trait]
impl CollectorRuntime for EarningsRuntime {
    fn name(&self) -> &'static str {
        "earnings_calls"
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let companies: Vec<EarningsCompany> = spec
            .parameters
            .decode("companies")
            .map_err(|e| FetchError::Permanent(format!("invalid earnings companies: {}", e)))?
            .unwrap_or_default();

        let items = companies.into_iter().map(|c| (c.name.clone(), c));
        collect_items(spec, items, |company| async move {
            self.collect_company(spec, ctx, &company).await
        })
        .await
    }
}
