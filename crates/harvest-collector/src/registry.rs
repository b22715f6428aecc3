//! Collector Registry.
//!
//! 설정의 `collectors` 섹션에서 [`CollectorSpec`] 목록을 만들고 검증합니다.
//!
//! ```yaml
//! collectors:
//!   market_data:
//!     equities: { enabled: true, interval: 60, tickers: [AAPL, MSFT] }
//!   unstructured_data:
//!     enabled: true          # 그룹 전체 on/off (선택)
//!     news: { interval: 300, sources: [...] }
//! ```
//!
//! 각 항목의 id는 `<group>.<name>`이며, 카테고리는 이름 또는 `category`
//! 파라미터로 정해집니다. 검증 실패는 모두 [`ConfigError`]로 시작 시점에
//! 보고됩니다.

use std::collections::{BTreeMap, HashMap};

use harvest_core::{Category, CollectorSpec, ConfigError, Parameters};
use scraper::Selector;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{CollectorError, Result};
use crate::runtime::filings::EarningsCompany;
use crate::runtime::geopolitical::EventSource;
use crate::runtime::news::NewsSource;

/// `collectors` 설정 섹션 (그룹 → 이름 → 항목).
pub type CollectorsConfig = BTreeMap<String, Map<String, Value>>;

/// 항목 설정 중 파라미터가 아닌 키.
const RESERVED_KEYS: [&str; 3] = ["enabled", "interval", "interval_seconds"];

/// 검증된 collector 목록.
#[derive(Debug, Clone, Default)]
pub struct CollectorRegistry {
    /// id 순으로 정렬
    specs: Vec<CollectorSpec>,
    index: HashMap<String, usize>,
}

impl CollectorRegistry {
    /// 설정 섹션에서 레지스트리를 만듭니다.
    pub fn from_config(collectors: &CollectorsConfig) -> std::result::Result<Self, ConfigError> {
        let mut specs = Vec::new();

        for (group, entries) in collectors {
            let group_enabled = match entries.get("enabled") {
                None => true,
                Some(value) => parse_bool(value).ok_or_else(|| {
                    ConfigError::Invalid(format!("collectors.{}.enabled must be a boolean", group))
                })?,
            };

            for (name, entry) in entries {
                if name == "enabled" {
                    continue;
                }
                let id = format!("{}.{}", group, name);
                let Value::Object(entry) = entry else {
                    return Err(ConfigError::Invalid(format!(
                        "collectors.{} must be a mapping",
                        id
                    )));
                };

                let mut spec = build_spec(&id, name, entry)?;
                spec.enabled &= group_enabled;
                specs.push(spec);
            }
        }

        Self::from_specs(specs)
    }

    /// 이미 만들어진 spec 목록을 검증해 레지스트리를 만듭니다.
    pub fn from_specs(mut specs: Vec<CollectorSpec>) -> std::result::Result<Self, ConfigError> {
        specs.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if spec.interval_seconds == 0 {
                return Err(ConfigError::InvalidInterval {
                    id: spec.id.clone(),
                    interval: "0".to_string(),
                });
            }
            validate_parameters(spec)?;
            if index.insert(spec.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateId(spec.id.clone()));
            }
        }

        Ok(Self { specs, index })
    }

    /// 활성화된 collector 목록.
    pub fn list_enabled(&self) -> Vec<CollectorSpec> {
        self.specs.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<&CollectorSpec> {
        self.index
            .get(id)
            .map(|&i| &self.specs[i])
            .ok_or_else(|| CollectorError::NotFound(id.to_string()))
    }

    /// 모든 collector (비활성 포함, id 순).
    pub fn iter(&self) -> impl Iterator<Item = &CollectorSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_interval(id: &str, entry: &Map<String, Value>) -> std::result::Result<u64, ConfigError> {
    let value = entry
        .get("interval")
        .or_else(|| entry.get("interval_seconds"))
        .ok_or_else(|| ConfigError::MissingParameter {
            id: id.to_string(),
            parameter: "interval".to_string(),
        })?;

    let invalid = || ConfigError::InvalidInterval {
        id: id.to_string(),
        interval: value.to_string(),
    };
    let seconds = match value {
        Value::Number(n) => n.as_u64().ok_or_else(invalid)?,
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };
    if seconds == 0 {
        return Err(invalid());
    }
    Ok(seconds)
}

fn build_spec(
    id: &str,
    name: &str,
    entry: &Map<String, Value>,
) -> std::result::Result<CollectorSpec, ConfigError> {
    let category_name = match entry.get("category") {
        Some(Value::String(c)) => c.as_str(),
        Some(other) => {
            return Err(ConfigError::UnknownCategory {
                id: id.to_string(),
                category: other.to_string(),
            })
        }
        None => name,
    };
    let category: Category = category_name
        .parse()
        .map_err(|_| ConfigError::UnknownCategory {
            id: id.to_string(),
            category: category_name.to_string(),
        })?;

    let enabled = match entry.get("enabled") {
        None => true,
        Some(value) => parse_bool(value).ok_or_else(|| ConfigError::InvalidParameter {
            id: id.to_string(),
            parameter: "enabled".to_string(),
            reason: "must be a boolean".to_string(),
        })?,
    };

    let parameters: Map<String, Value> = entry
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(CollectorSpec {
        id: id.to_string(),
        category,
        interval_seconds: parse_interval(id, entry)?,
        enabled,
        parameters: Parameters::new(parameters),
    })
}

// ==================== 카테고리별 필수 파라미터 ====================

/// 카테고리별 필수 파라미터를 검증합니다.
pub fn validate_parameters(spec: &CollectorSpec) -> std::result::Result<(), ConfigError> {
    let list_key = match spec.category {
        Category::Equities => Some("tickers"),
        Category::Options => Some("underlyings"),
        Category::Futures => Some("symbols"),
        Category::Crypto => Some("assets"),
        Category::Twitter => Some("accounts"),
        Category::Reddit => Some("subreddits"),
        Category::SecFilings => Some("company_ciks"),
        _ => None,
    };
    if let Some(key) = list_key {
        if spec.parameters.string_list(key).is_empty() {
            return Err(missing(spec, key));
        }
    }

    match spec.category {
        Category::News => {
            let sources: Vec<NewsSource> =
                decode_items(spec, "sources", &["url", "headlines_selector"])?;
            for source in &sources {
                check_selector(spec, "sources", &source.headlines_selector)?;
                if let Some(css) = &source.article_selector {
                    check_selector(spec, "sources", css)?;
                }
            }
        }
        Category::EarningsCalls => {
            let companies: Vec<EarningsCompany> =
                decode_items(spec, "companies", &["name", "url", "transcript_selector"])?;
            for company in &companies {
                check_selector(spec, "companies", &company.transcript_selector)?;
                if let Some(css) = &company.date_selector {
                    check_selector(spec, "companies", css)?;
                }
            }
        }
        Category::Geopolitical => {
            let sources: Vec<EventSource> = decode_items(
                spec,
                "sources",
                &["url", "event_selector", "title_selector", "date_selector"],
            )?;
            for source in &sources {
                for css in [
                    Some(&source.event_selector),
                    Some(&source.title_selector),
                    Some(&source.date_selector),
                    source.description_selector.as_ref(),
                ]
                .into_iter()
                .flatten()
                {
                    check_selector(spec, "sources", css)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn missing(spec: &CollectorSpec, parameter: &str) -> ConfigError {
    ConfigError::MissingParameter {
        id: spec.id.clone(),
        parameter: parameter.to_string(),
    }
}

/// 객체 배열 파라미터의 필수 키를 확인하고 타입으로 변환합니다.
fn decode_items<T: DeserializeOwned>(
    spec: &CollectorSpec,
    key: &str,
    required: &[&str],
) -> std::result::Result<Vec<T>, ConfigError> {
    if spec.parameters.array_len(key) == 0 {
        return Err(missing(spec, key));
    }

    let items: Vec<Map<String, Value>> = spec
        .parameters
        .decode(key)
        .map_err(|e| ConfigError::InvalidParameter {
            id: spec.id.clone(),
            parameter: key.to_string(),
            reason: e.to_string(),
        })?
        .unwrap_or_default();

    for (i, item) in items.iter().enumerate() {
        for field in required {
            let present = matches!(item.get(*field), Some(Value::String(s)) if !s.trim().is_empty());
            if !present {
                return Err(missing(spec, &format!("{}[{}].{}", key, i, field)));
            }
        }
    }

    spec.parameters
        .decode(key)
        .map(Option::unwrap_or_default)
        .map_err(|e| ConfigError::InvalidParameter {
            id: spec.id.clone(),
            parameter: key.to_string(),
            reason: e.to_string(),
        })
}

fn check_selector(
    spec: &CollectorSpec,
    key: &str,
    css: &str,
) -> std::result::Result<(), ConfigError> {
    Selector::parse(css)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidParameter {
            id: spec.id.clone(),
            parameter: key.to_string(),
            reason: format!("invalid selector '{}': {}", css, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collectors(value: Value) -> CollectorsConfig {
        serde_json::from_value(value).unwrap()
    }

    fn sample() -> CollectorsConfig {
        collectors(json!({
            "market_data": {
                "equities": { "enabled": true, "interval": 60, "tickers": ["AAPL", "MSFT"] },
                "crypto": { "enabled": false, "interval": 30, "assets": ["BTC-USD"] }
            },
            "unstructured_data": {
                "news": {
                    "interval": 300,
                    "sources": [{ "url": "https://example.com", "headlines_selector": "h3 a" }]
                },
                "wire_news": {
                    "category": "news",
                    "interval": "600",
                    "sources": [{ "url": "https://wire.example.com", "headlines_selector": "h2" }]
                }
            },
            "macro_data": {
                "cpi": { "interval": 86400 },
                "fed_rates": { "interval": 86400 }
            }
        }))
    }

    #[test]
    fn test_builds_specs_from_groups() {
        let registry = CollectorRegistry::from_config(&sample()).unwrap();

        assert_eq!(registry.len(), 6);
        let equities = registry.get("market_data.equities").unwrap();
        assert_eq!(equities.category, Category::Equities);
        assert_eq!(equities.interval_seconds, 60);
        // 예약 키는 파라미터에서 제외
        assert!(!equities.parameters.contains("interval"));
        assert!(!equities.parameters.contains("enabled"));
        assert_eq!(equities.parameters.string_list("tickers"), vec!["AAPL", "MSFT"]);

        // category 파라미터로 같은 카테고리 collector 여러 개
        let wire = registry.get("unstructured_data.wire_news").unwrap();
        assert_eq!(wire.category, Category::News);
        assert_eq!(wire.interval_seconds, 600);
    }

    #[test]
    fn test_list_enabled_skips_disabled() {
        let registry = CollectorRegistry::from_config(&sample()).unwrap();
        let enabled: Vec<String> = registry.list_enabled().into_iter().map(|s| s.id).collect();

        assert_eq!(enabled.len(), 5);
        assert!(!enabled.contains(&"market_data.crypto".to_string()));
        // 비활성 collector도 조회는 가능
        assert!(!registry.get("market_data.crypto").unwrap().enabled);
    }

    #[test]
    fn test_group_enabled_flag() {
        let mut config = sample();
        config
            .get_mut("macro_data")
            .unwrap()
            .insert("enabled".to_string(), json!(false));

        let registry = CollectorRegistry::from_config(&config).unwrap();
        assert!(!registry.get("macro_data.cpi").unwrap().enabled);
        assert_eq!(registry.list_enabled().len(), 3);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let registry = CollectorRegistry::from_config(&sample()).unwrap();
        assert!(matches!(
            registry.get("market_data.bonds"),
            Err(CollectorError::NotFound(id)) if id == "market_data.bonds"
        ));
    }

    #[test]
    fn test_invalid_interval() {
        for interval in [json!(0), json!(-5), json!("soon"), json!(1.5)] {
            let config = collectors(json!({
                "macro_data": { "cpi": { "interval": interval } }
            }));
            assert!(
                matches!(
                    CollectorRegistry::from_config(&config),
                    Err(ConfigError::InvalidInterval { .. })
                ),
                "interval {} accepted",
                interval
            );
        }
    }

    #[test]
    fn test_unknown_category() {
        let config = collectors(json!({
            "market_data": { "bonds": { "interval": 60 } }
        }));
        assert!(matches!(
            CollectorRegistry::from_config(&config),
            Err(ConfigError::UnknownCategory { category, .. }) if category == "bonds"
        ));
    }

    #[test]
    fn test_duplicate_id() {
        let spec = CollectorRegistry::from_config(&sample())
            .unwrap()
            .get("macro_data.cpi")
            .unwrap()
            .clone();

        assert!(matches!(
            CollectorRegistry::from_specs(vec![spec.clone(), spec]),
            Err(ConfigError::DuplicateId(id)) if id == "macro_data.cpi"
        ));
    }

    #[test]
    fn test_missing_required_parameters() {
        let cases = [
            json!({ "market_data": { "equities": { "interval": 60, "tickers": [] } } }),
            json!({ "market_data": { "options": { "interval": 60 } } }),
            json!({ "unstructured_data": { "sec_filings": { "interval": 60 } } }),
            json!({ "unstructured_data": { "news": { "interval": 60, "sources": [{ "url": "https://x" }] } } }),
            json!({ "unstructured_data": { "earnings": {
                "interval": 60,
                "companies": [{ "name": "Apple", "url": "https://x" }]
            } } }),
            json!({ "macro_data": { "geopolitical": {
                "interval": 60,
                "sources": [{ "url": "https://x", "event_selector": "div", "title_selector": "h4" }]
            } } }),
        ];

        for case in cases {
            let result = CollectorRegistry::from_config(&collectors(case.clone()));
            assert!(
                matches!(result, Err(ConfigError::MissingParameter { .. })),
                "{} accepted",
                case
            );
        }
    }

    #[test]
    fn test_missing_parameter_names_the_field() {
        let config = collectors(json!({ "unstructured_data": { "news": {
            "interval": 60,
            "sources": [
                { "url": "https://a", "headlines_selector": "h3" },
                { "url": "https://b" }
            ]
        } } }));

        match CollectorRegistry::from_config(&config) {
            Err(ConfigError::MissingParameter { parameter, .. }) => {
                assert_eq!(parameter, "sources[1].headlines_selector")
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_invalid_selector_rejected() {
        let config = collectors(json!({ "unstructured_data": { "news": {
            "interval": 60,
            "sources": [{ "url": "https://a", "headlines_selector": "h3[[" }]
        } } }));

        assert!(matches!(
            CollectorRegistry::from_config(&config),
            Err(ConfigError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_categories_without_required_parameters() {
        let config = collectors(json!({ "macro_data": {
            "fed_rates": { "interval": 3600 },
            "cpi": { "interval": 86400, "series_id": "CUUR0000SA0" }
        } }));
        let registry = CollectorRegistry::from_config(&config).unwrap();
        assert_eq!(registry.list_enabled().len(), 2);
    }
}
