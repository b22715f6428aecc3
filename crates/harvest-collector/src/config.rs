//! 설정 파일 로드.
//!
//! YAML 설정 파일을 읽고 `HARVEST__` 접두사의 환경 변수로 덮어씁니다
//! (예: `HARVEST__STORAGE__TYPE=database`). `.env` 파일이 있으면 먼저 로드합니다.
//! 설정은 시작 시 한 번만 읽으며 이후 변경되지 않습니다.

use std::path::Path;

use harvest_core::{ConfigError, LoggingConfig, StorageConfig};
use serde::Deserialize;

use crate::captcha::CaptchaConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::http::WebScrapingConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::registry::{CollectorRegistry, CollectorsConfig};
use crate::retry::RetryConfig;
use crate::runtime::Credentials;
use crate::scheduler::SchedulerConfig;

/// 환경 변수 접두사
pub const ENV_PREFIX: &str = "HARVEST";

/// 전체 설정.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestConfig {
    /// 그룹 → 이름 → collector 항목
    #[serde(default)]
    pub collectors: CollectorsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub captcha: CaptchaConfig,
    #[serde(default)]
    pub web_scraping: WebScrapingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 외부 API 자격 증명 (없으면 환경 변수 사용)
    #[serde(default)]
    pub credentials: Credentials,
}

impl HarvestConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Load(format!(
                "설정 파일을 찾을 수 없습니다: {}",
                path.display()
            )));
        }

        let config = Self::build(config::File::from(path), environment())?;
        tracing::debug!(path = %path.display(), collectors = config.collectors.len(), "설정 로드 완료");
        Ok(config)
    }

    /// YAML 문자열에서 설정을 로드합니다 (환경 변수 오버라이드 없음).
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Self::build(
            config::File::from_str(yaml, config::FileFormat::Yaml),
            config::Environment::with_prefix(ENV_PREFIX).source(Some(config::Map::new())),
        )
    }

    fn build<S>(file: S, env: config::Environment) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut config: Self = config::Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()?;

        config.credentials = config.credentials.with_env_fallback();
        Ok(config)
    }

    /// 모든 섹션을 검증하고 collector 레지스트리를 만듭니다.
    pub fn validate(&self) -> Result<CollectorRegistry, ConfigError> {
        self.scheduler.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        if self.web_scraping.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "web_scraping.request_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.captcha.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "captcha.timeout_secs must be > 0".to_string(),
            ));
        }
        CollectorRegistry::from_config(&self.collectors)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::StorageKind;
    use secrecy::ExposeSecret;

    const SAMPLE: &str = r#"
collectors:
  market_data:
    equities:
      enabled: true
      interval: 60
      tickers: [AAPL, MSFT]
  unstructured_data:
    news:
      enabled: true
      interval: 300
      sources:
        - url: "https://example.com"
          name: "Example"
          headlines_selector: "h3 a"
          article_selector: "p"
  macro_data:
    cpi:
      enabled: true
      interval: 86400
storage:
  type: memory
captcha:
  api_key: "anti-key"
  timeout_secs: 90
scheduler:
  max_concurrency: 4
retry:
  max_attempts: 4
  base_delay_ms: 250
rate_limit:
  default: { capacity: 3, refill_per_sec: 2.0 }
  hosts:
    - { host: "www.sec.gov", capacity: 2, refill_per_sec: 0.5 }
"#;

    #[test]
    fn test_load_sample_yaml() {
        let config = HarvestConfig::from_yaml_str(SAMPLE).unwrap();

        assert_eq!(config.storage.kind, StorageKind::Memory);
        assert_eq!(config.captcha.timeout_secs, 90);
        assert_eq!(
            config.captcha.api_key.as_ref().unwrap().expose_secret(),
            "anti-key"
        );
        assert_eq!(config.scheduler.max_concurrency, 4);
        assert_eq!(config.retry.max_attempts, 4);
        // base_delay_ms는 base_backoff_ms의 별칭
        assert_eq!(config.retry.base_backoff_ms, 250);
        assert_eq!(config.rate_limit.bucket_for("www.sec.gov").capacity, 2);
        assert_eq!(config.rate_limit.bucket_for("query1.finance.yahoo.com").capacity, 3);

        let registry = config.validate().unwrap();
        assert_eq!(registry.list_enabled().len(), 3);
    }

    #[test]
    fn test_defaults_for_missing_sections() {
        let config = HarvestConfig::from_yaml_str("collectors: {}").unwrap();

        assert_eq!(config.storage.kind, StorageKind::File);
        assert_eq!(config.scheduler.max_concurrency, 8);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
        assert_eq!(config.web_scraping.request_timeout_secs, 10);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_environment_overrides_file() {
        let env: config::Map<String, String> = [
            ("HARVEST__STORAGE__TYPE", "database"),
            ("HARVEST__SCHEDULER__MAX_CONCURRENCY", "2"),
            ("HARVEST__STORAGE__DATABASE__HOST", "db.internal"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = HarvestConfig::build(
            config::File::from_str(SAMPLE, config::FileFormat::Yaml),
            environment().source(Some(env)),
        )
        .unwrap();

        assert_eq!(config.storage.kind, StorageKind::Database);
        assert_eq!(config.storage.database.host, "db.internal");
        assert_eq!(config.scheduler.max_concurrency, 2);
    }

    #[test]
    fn test_validate_rejects_bad_sections() {
        let mut config = HarvestConfig::from_yaml_str(SAMPLE).unwrap();
        config.scheduler.max_concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = HarvestConfig::from_yaml_str(SAMPLE).unwrap();
        config.retry.jitter_ratio = 0.9;
        assert!(config.validate().is_err());

        let bad_interval = SAMPLE.replace("interval: 60", "interval: 0");
        let config = HarvestConfig::from_yaml_str(&bad_interval).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_load_error() {
        assert!(matches!(
            HarvestConfig::load("does/not/exist.yaml"),
            Err(ConfigError::Load(_))
        ));
    }
}
