//! tracing 기반 로깅 초기화.
//!
//! 출력 형식은 세 가지를 지원합니다:
//! - **pretty**: 개발용 여러 줄 형식
//! - **json**: 로그 수집기용 JSON 형식
//! - **compact**: 한 줄 형식
//!
//! `RUST_LOG`가 설정되어 있으면 설정 파일의 레벨보다, `LOG_FORMAT`이 설정되어
//! 있으면 설정 파일의 형식보다 우선합니다.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 워크스페이스 크레이트 목록 (레벨 지시자 생성용).
const WORKSPACE_TARGETS: [&str; 3] = ["harvest_core", "harvest_data", "harvest_collector"];

/// 로그 출력 형식.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// 로깅 설정.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 레벨 또는 필터 지시자 (예: "info", "harvest_collector=debug")
    pub level: String,
    pub format: LogFormat,
    /// span 진입/종료 이벤트 출력
    pub with_span_events: bool,
    /// 파일명/줄 번호 출력
    pub with_file: bool,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// 레벨만 지정된 경우 워크스페이스 크레이트에만 적용하는 필터 문자열.
    ///
    /// `"debug"` → `"warn,harvest_core=debug,harvest_data=debug,harvest_collector=debug"`.
    /// 이미 지시자 형식(`=` 포함)이면 그대로 사용합니다.
    pub fn filter_directives(&self) -> String {
        if self.level.contains('=') || self.level.contains(',') {
            return self.level.clone();
        }

        let mut directives = String::from("warn");
        for target in WORKSPACE_TARGETS {
            directives.push_str(&format!(",{}={}", target, self.level));
        }
        directives
    }
}

/// 로깅 시스템을 초기화합니다.
///
/// 이미 전역 subscriber가 설정되어 있으면 에러를 반환합니다.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directives()))?;

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    // 형식마다 layer 타입이 달라 분기별로 초기화
    let registry = tracing_subscriber::registry().with(env_filter);
    let base = fmt::layer()
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_target(config.with_target)
        .with_span_events(span_events);

    match config.format {
        LogFormat::Pretty => registry.with(base.pretty()).try_init()?,
        LogFormat::Json => registry
            .with(base.json().with_current_span(true).flatten_event(true))
            .try_init()?,
        LogFormat::Compact => registry.with(base.compact()).try_init()?,
    }

    tracing::info!(
        format = ?config.format,
        level = %config.level,
        "Logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_filter_directives_from_level() {
        let config = LogConfig::new("debug");
        assert_eq!(
            config.filter_directives(),
            "warn,harvest_core=debug,harvest_data=debug,harvest_collector=debug"
        );
    }

    #[test]
    fn test_filter_directives_passthrough() {
        let config = LogConfig::new("info,sqlx=warn");
        assert_eq!(config.filter_directives(), "info,sqlx=warn");
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new("trace")
            .with_format(LogFormat::Compact)
            .with_span_events(true);

        assert_eq!(config.level, "trace");
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.with_span_events);
    }
}
