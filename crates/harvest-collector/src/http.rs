//! Outbound HTTP 클라이언트.
//!
//! 모든 런타임은 이 클라이언트로만 외부에 요청합니다. 요청마다:
//! 1. 대상 호스트의 rate limit 토큰 획득
//! 2. User-Agent 로테이션
//! 3. 캡차 토큰이 있으면 헤더로 주입
//! 4. 실패를 Transient / Permanent로 분류
//!
//! 응답 수신 시각(`fetched_at`)은 레코드의 `captured_at`으로 사용됩니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use harvest_core::ConfigError;

use crate::captcha::{detect_challenge, CAPTCHA_SOLUTION_HEADER};
use crate::error::FetchError;
use crate::rate_limiter::RateLimiter;

/// User-Agent 파일이 없을 때 사용하는 기본값.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:98.0) Gecko/20100101 Firefox/98.0";

/// 웹 요청 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebScrapingConfig {
    /// User-Agent 목록 파일 (한 줄에 하나)
    #[serde(default)]
    pub user_agents_file: Option<PathBuf>,
    /// 요청 타임아웃 (초)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for WebScrapingConfig {
    fn default() -> Self {
        Self {
            user_agents_file: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// User-Agent 로테이션 풀.
#[derive(Debug, Clone)]
pub struct UserAgentPool {
    agents: Vec<String>,
}

impl UserAgentPool {
    pub fn new(agents: Vec<String>) -> Self {
        let agents: Vec<String> = agents
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty() && !a.starts_with('#'))
            .collect();

        if agents.is_empty() {
            Self::default()
        } else {
            Self { agents }
        }
    }

    /// 파일에서 로드합니다. 파일이 없거나 읽을 수 없으면 기본값을 사용합니다.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let pool = Self::new(content.lines().map(str::to_string).collect());
                debug!(path = %path.display(), agents = pool.len(), "User agents loaded");
                pool
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "User agents file unreadable, using default");
                Self::default()
            }
        }
    }

    pub fn pick(&self) -> &str {
        self.agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(DEFAULT_USER_AGENT)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for UserAgentPool {
    fn default() -> Self {
        Self {
            agents: vec![DEFAULT_USER_AGENT.to_string()],
        }
    }
}

/// 응답 본문과 수신 시각.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub body: T,
    /// 응답 헤더를 받은 시각
    pub fetched_at: DateTime<Utc>,
    /// 최종 URL (리다이렉트 반영)
    pub url: Url,
}

/// rate limit, UA 로테이션, 에러 분류가 적용된 HTTP 클라이언트.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    limiter: RateLimiter,
    user_agents: Arc<UserAgentPool>,
    captcha_token: Option<Arc<str>>,
}

impl HttpClient {
    pub fn new(config: &WebScrapingConfig, limiter: RateLimiter) -> Result<Self, ConfigError> {
        let user_agents = config
            .user_agents_file
            .as_deref()
            .map(UserAgentPool::load)
            .unwrap_or_default();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            limiter,
            user_agents: Arc::new(user_agents),
            captcha_token: None,
        })
    }

    /// 캡차 해결 토큰을 모든 요청에 싣는 사본을 만듭니다.
    pub fn with_captcha_token(&self, token: impl Into<Arc<str>>) -> Self {
        Self {
            captcha_token: Some(token.into()),
            ..self.clone()
        }
    }

    pub fn has_captcha_token(&self) -> bool {
        self.captcha_token.is_some()
    }

    /// 요청을 보내고 성공 응답을 반환합니다.
    async fn send(
        &self,
        method: Method,
        url: &str,
        configure: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<(reqwest::Response, DateTime<Utc>), FetchError> {
        let parsed = Url::parse(url)
            .map_err(|e| FetchError::Permanent(format!("invalid url '{}': {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::Permanent(format!("url without host: {}", url)))?
            .to_string();

        self.limiter
            .acquire(&host)
            .await
            .map_err(|e| FetchError::RateLimitExceeded {
                host: e.host,
                retry_after: e.retry_after,
            })?;

        let mut headers = HeaderMap::new();
        if let Ok(agent) = HeaderValue::from_str(self.user_agents.pick()) {
            headers.insert(USER_AGENT, agent);
        }
        if let Some(token) = &self.captcha_token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert(CAPTCHA_SOLUTION_HEADER, value);
            }
        }

        let request = configure(self.client.request(method, parsed).headers(headers));
        let response = request.send().await.map_err(classify_transport)?;
        let fetched_at = Utc::now();

        let status = response.status();
        if status.is_success() {
            return Ok((response, fetched_at));
        }

        let message = format!("HTTP {} from {}", status, url);
        if is_transient_status(status) {
            Err(FetchError::Transient(message))
        } else {
            Err(FetchError::Permanent(message))
        }
    }

    /// GET 요청의 본문 텍스트.
    pub async fn get_text(&self, url: &str) -> Result<Fetched<String>, FetchError> {
        let (response, fetched_at) = self.send(Method::GET, url, |r| r).await?;
        let final_url = response.url().clone();
        let body = response.text().await.map_err(classify_body)?;
        Ok(Fetched {
            body,
            fetched_at,
            url: final_url,
        })
    }

    /// 캡차 감지가 적용된 HTML 페이지 GET.
    pub async fn get_page(&self, url: &str) -> Result<Fetched<String>, FetchError> {
        let page = self.get_text(url).await?;
        if let Some(challenge) = detect_challenge(url, &page.body) {
            return Err(FetchError::Captcha(challenge));
        }
        Ok(page)
    }

    /// GET 요청의 JSON 본문.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        configure: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Fetched<T>, FetchError> {
        let (response, fetched_at) = self.send(Method::GET, url, configure).await?;
        let final_url = response.url().clone();
        let body = response.json().await.map_err(classify_body)?;
        Ok(Fetched {
            body,
            fetched_at,
            url: final_url,
        })
    }

    /// JSON 본문 POST.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        payload: &B,
    ) -> Result<Fetched<T>, FetchError> {
        let (response, fetched_at) = self
            .send(Method::POST, url, |r| r.json(payload))
            .await?;
        let final_url = response.url().clone();
        let body = response.json().await.map_err(classify_body)?;
        Ok(Fetched {
            body,
            fetched_at,
            url: final_url,
        })
    }
}

/// 429/408/5xx는 재시도 가능.
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Permanent(err.to_string())
    } else {
        // 타임아웃, 연결 실패, 중간 끊김
        FetchError::Transient(err.to_string())
    }
}

fn classify_body(err: reqwest::Error) -> FetchError {
    if err.is_decode() {
        FetchError::Permanent(format!("invalid response body: {}", err))
    } else {
        FetchError::Transient(err.to_string())
    }
}
