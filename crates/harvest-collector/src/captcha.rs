//! 캡차 감지 및 외부 캡차 풀이 서비스 연동.
//!
//! 페이지 본문에 "captcha"가 포함되고 `div.g-recaptcha[data-sitekey]`가 있으면
//! 캡차 페이지로 판단합니다. 풀이는 [`CaptchaSolver`] 뒤에 숨겨져 있으며
//! 기본 구현은 AntiCaptcha의 `createTask` / `getTaskResult` API입니다.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use harvest_core::deserialize_secret;

/// 캡차 해결 토큰을 실어 보내는 요청 헤더.
pub const CAPTCHA_SOLUTION_HEADER: &str = "x-captcha-solution";

/// 캡차 챌린지.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaChallenge {
    /// 캡차가 나타난 페이지
    pub page_url: String,
    /// reCAPTCHA site key
    pub site_key: String,
}

impl fmt::Display for CaptchaChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (sitekey {})", self.page_url, self.site_key)
    }
}

/// 페이지에서 캡차 챌린지를 찾습니다.
pub fn detect_challenge(page_url: &str, body: &str) -> Option<CaptchaChallenge> {
    if !body.to_lowercase().contains("captcha") {
        return None;
    }

    let document = Html::parse_document(body);
    let selector = Selector::parse("div.g-recaptcha[data-sitekey]").ok()?;
    let site_key = document
        .select(&selector)
        .next()?
        .value()
        .attr("data-sitekey")?
        .trim()
        .to_string();

    (!site_key.is_empty()).then(|| CaptchaChallenge {
        page_url: page_url.to_string(),
        site_key,
    })
}

/// 캡차 풀이 에러.
#[derive(Debug, Error)]
pub enum CaptchaError {
    /// 풀이 서비스가 거부함
    #[error("Captcha solver rejected the task: {0}")]
    Rejected(String),

    /// 풀이 서비스 통신 실패
    #[error("Captcha solver transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for CaptchaError {
    fn from(err: reqwest::Error) -> Self {
        CaptchaError::Transport(err.to_string())
    }
}

/// 외부 캡차 풀이 서비스.
///
/// 호출 측이 전체 대기 시간을 제한하므로 구현은 자체 타임아웃이 필요 없습니다.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError>;
}

/// 캡차 설정.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaConfig {
    /// AntiCaptcha API 키 (없으면 풀이 비활성화)
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    /// 풀이 대기 한도 (초)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 결과 폴링 간격 (초)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// API 엔드포인트
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_timeout_secs() -> u64 {
    120
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_base_url() -> String {
    "https://api.anti-captcha.com".to_string()
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            base_url: default_base_url(),
        }
    }
}

impl CaptchaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// AntiCaptcha 클라이언트.
pub struct AntiCaptchaSolver {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    error_id: i64,
    error_description: Option<String>,
    task_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultResponse {
    error_id: i64,
    error_description: Option<String>,
    status: Option<String>,
    solution: Option<TaskSolution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSolution {
    g_recaptcha_response: String,
}

impl AntiCaptchaSolver {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: default_base_url(),
            poll_interval: Duration::from_secs(default_poll_interval_secs()),
        }
    }

    /// 설정에 API 키가 있으면 풀이기를 생성합니다.
    pub fn from_config(config: &CaptchaConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn create_task(&self, challenge: &CaptchaChallenge) -> Result<i64, CaptchaError> {
        let body = json!({
            "clientKey": self.api_key.expose_secret(),
            "task": {
                "type": "RecaptchaV2TaskProxyless",
                "websiteURL": challenge.page_url,
                "websiteKey": challenge.site_key,
            }
        });

        let response: CreateTaskResponse = self
            .client
            .post(format!("{}/createTask", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.error_id != 0 {
            return Err(CaptchaError::Rejected(
                response
                    .error_description
                    .unwrap_or_else(|| format!("errorId {}", response.error_id)),
            ));
        }
        response
            .task_id
            .ok_or_else(|| CaptchaError::Rejected("createTask returned no taskId".to_string()))
    }
}

#[async_trait]
impl CaptchaSolver for AntiCaptchaSolver {
    async fn solve(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
        let task_id = self.create_task(challenge).await?;
        info!(task_id, page = %challenge.page_url, "Captcha task submitted");

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let response: TaskResultResponse = self
                .client
                .post(format!("{}/getTaskResult", self.base_url))
                .json(&json!({
                    "clientKey": self.api_key.expose_secret(),
                    "taskId": task_id,
                }))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if response.error_id != 0 {
                return Err(CaptchaError::Rejected(
                    response
                        .error_description
                        .unwrap_or_else(|| format!("errorId {}", response.error_id)),
                ));
            }

            match (response.status.as_deref(), response.solution) {
                (Some("ready"), Some(solution)) => {
                    info!(task_id, "Captcha solved");
                    return Ok(solution.g_recaptcha_response);
                }
                (Some("ready"), None) => {
                    return Err(CaptchaError::Rejected(
                        "task ready without solution".to_string(),
                    ))
                }
                (status, _) => debug!(task_id, status = ?status, "Captcha still processing"),
            }
        }
    }
}
