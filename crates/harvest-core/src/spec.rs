//! Collector 정의.
//!
//! 설정에서 한 번 만들어진 뒤 변경되지 않는 [`CollectorSpec`]과
//! 수집 카테고리를 정의합니다.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 수집 카테고리.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Equities,
    Options,
    Futures,
    Crypto,
    News,
    Twitter,
    Reddit,
    SecFilings,
    EarningsCalls,
    FedRates,
    Cpi,
    Geopolitical,
}

impl Category {
    /// 모든 카테고리 반환.
    pub fn all() -> [Category; 12] {
        [
            Category::Equities,
            Category::Options,
            Category::Futures,
            Category::Crypto,
            Category::News,
            Category::Twitter,
            Category::Reddit,
            Category::SecFilings,
            Category::EarningsCalls,
            Category::FedRates,
            Category::Cpi,
            Category::Geopolitical,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Equities => "equities",
            Category::Options => "options",
            Category::Futures => "futures",
            Category::Crypto => "crypto",
            Category::News => "news",
            Category::Twitter => "twitter",
            Category::Reddit => "reddit",
            Category::SecFilings => "sec_filings",
            Category::EarningsCalls => "earnings_calls",
            Category::FedRates => "fed_rates",
            Category::Cpi => "cpi",
            Category::Geopolitical => "geopolitical",
        }
    }

    /// 카테고리가 속한 설정 그룹.
    pub fn group(&self) -> CategoryGroup {
        match self {
            Category::Equities | Category::Options | Category::Futures | Category::Crypto => {
                CategoryGroup::MarketData
            }
            Category::News
            | Category::Twitter
            | Category::Reddit
            | Category::SecFilings
            | Category::EarningsCalls => CategoryGroup::UnstructuredData,
            Category::FedRates | Category::Cpi | Category::Geopolitical => {
                CategoryGroup::MacroData
            }
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "equities" => Ok(Category::Equities),
            "options" => Ok(Category::Options),
            "futures" => Ok(Category::Futures),
            "crypto" => Ok(Category::Crypto),
            "news" => Ok(Category::News),
            "twitter" => Ok(Category::Twitter),
            "reddit" => Ok(Category::Reddit),
            "sec_filings" => Ok(Category::SecFilings),
            // 설정 파일에서는 "earnings"로 쓰는 경우가 많음
            "earnings" | "earnings_calls" => Ok(Category::EarningsCalls),
            "fed_rates" => Ok(Category::FedRates),
            "cpi" => Ok(Category::Cpi),
            "geopolitical" => Ok(Category::Geopolitical),
            _ => Err(format!("Unknown category: {}", s)),
        }
    }
}

/// 설정 파일의 `collectors.*` 그룹.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryGroup {
    MarketData,
    UnstructuredData,
    MacroData,
}

impl CategoryGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryGroup::MarketData => "market_data",
            CategoryGroup::UnstructuredData => "unstructured_data",
            CategoryGroup::MacroData => "macro_data",
        }
    }
}

impl fmt::Display for CategoryGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategoryGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "market_data" => Ok(CategoryGroup::MarketData),
            "unstructured_data" => Ok(CategoryGroup::UnstructuredData),
            "macro_data" => Ok(CategoryGroup::MacroData),
            _ => Err(format!("Unknown collector group: {}", s)),
        }
    }
}

/// 카테고리별 파라미터.
///
/// 내용은 해석하지 않고 그대로 보관하며, 각 런타임이 필요한 키만 꺼내 씁니다.
/// 환경 변수로 덮어쓴 값은 문자열로 들어올 수 있으므로 접근자는 관대하게 변환합니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(Map<String, Value>);

impl Parameters {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// 문자열 값.
    pub fn str(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim()),
            _ => None,
        }
    }

    /// 문자열 목록.
    ///
    /// 배열(문자열/숫자 혼합 허용) 또는 쉼표로 구분된 문자열을 받습니다.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::Number(n)) => vec![n.to_string()],
            _ => Vec::new(),
        }
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// 배열 항목의 개수 (배열이 아니면 0).
    pub fn array_len(&self, key: &str) -> usize {
        match self.0.get(key) {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        }
    }

    /// 구조화된 값을 타입으로 역직렬화합니다.
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        match self.0.get(key) {
            Some(value) => serde_json::from_value(value.clone()).map(Some),
            None => Ok(None),
        }
    }
}

impl From<Map<String, Value>> for Parameters {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// 수집기 정의.
///
/// 프로세스 시작 시 설정에서 생성되며 이후 변경되지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorSpec {
    /// `<group>.<name>` 형식의 고유 id
    pub id: String,
    /// 수집 카테고리
    pub category: Category,
    /// 수집 주기 (초, 0보다 큼)
    pub interval_seconds: u64,
    /// 활성화 여부
    pub enabled: bool,
    /// 카테고리별 파라미터
    pub parameters: Parameters,
}

impl CollectorSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => Parameters::new(map),
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!("equities".parse::<Category>().unwrap(), Category::Equities);
        assert_eq!("earnings".parse::<Category>().unwrap(), Category::EarningsCalls);
        assert_eq!("SEC_FILINGS".parse::<Category>().unwrap(), Category::SecFilings);
        assert!("weather".parse::<Category>().is_err());
    }

    #[test]
    fn test_category_roundtrip_display() {
        for category in Category::all() {
            assert_eq!(category.to_string().parse::<Category>().unwrap(), category);
        }
    }

    #[test]
    fn test_category_group() {
        assert_eq!(Category::Crypto.group(), CategoryGroup::MarketData);
        assert_eq!(Category::SecFilings.group(), CategoryGroup::UnstructuredData);
        assert_eq!(Category::Cpi.group(), CategoryGroup::MacroData);
    }

    #[test]
    fn test_string_list_accepts_arrays_and_csv() {
        let p = params(json!({
            "tickers": ["AAPL", " MSFT ", ""],
            "ciks": [320193, "0000789019"],
            "csv": "BTC-USD, ETH-USD",
        }));

        assert_eq!(p.string_list("tickers"), vec!["AAPL", "MSFT"]);
        assert_eq!(p.string_list("ciks"), vec!["320193", "0000789019"]);
        assert_eq!(p.string_list("csv"), vec!["BTC-USD", "ETH-USD"]);
        assert!(p.string_list("missing").is_empty());
    }

    #[test]
    fn test_scalar_accessors() {
        let p = params(json!({
            "limit": "25",
            "depth": 3,
            "flag": "true",
            "name": "  ",
        }));

        assert_eq!(p.u64("limit"), Some(25));
        assert_eq!(p.u64("depth"), Some(3));
        assert_eq!(p.bool("flag"), Some(true));
        // 공백 문자열은 값이 없는 것으로 취급
        assert_eq!(p.str("name"), None);
    }

    #[test]
    fn test_decode_structured_parameter() {
        #[derive(Deserialize)]
        struct Source {
            url: String,
        }

        let p = params(json!({ "sources": [{ "url": "https://example.com" }] }));
        let sources: Vec<Source> = p.decode("sources").unwrap().unwrap();
        assert_eq!(sources[0].url, "https://example.com");
        assert!(p.decode::<Vec<Source>>("other").unwrap().is_none());
    }
}
