use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

pub mod retry;

pub use da_core::{LlmResponse, PromptRequest};
pub use da_error::{DaError, Result};
pub use retry::{RetryPolicy, RetryingChatModel};

/// 默认的请求超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ERROR_BODY: usize = 500;
const MIN_API_KEY_LEN: usize = 20;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// 用于日志与错误信息的提供方名称
    fn provider(&self) -> &str;

    async fn complete(&self, prompt: &PromptRequest) -> Result<LlmResponse>;

    /// 上游可达性检查
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ========== Failure mapping ==========

/// 把上游的非 2xx 响应映射为具体的错误类型
pub fn classify_failure(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> DaError {
    let lower = body.to_ascii_lowercase();
    let message = format!("status={} body={}", status.as_u16(), clip(body, MAX_ERROR_BODY));
    let provider = provider.to_string();

    if status == StatusCode::TOO_MANY_REQUESTS
        || lower.contains("insufficient_quota")
        || lower.contains("quota exceeded")
    {
        return DaError::RateLimited {
            provider,
            message,
            retry_after,
        };
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DaError::AuthenticationFailed { provider, message }
        }
        StatusCode::REQUEST_TIMEOUT => DaError::ProviderUnavailable { provider, message },
        s if s.is_server_error() => DaError::ProviderUnavailable { provider, message },
        s if s.is_client_error() => DaError::InvalidRequest { provider, message },
        _ => DaError::ProviderUnavailable { provider, message },
    }
}

fn transport_error(provider: &str, err: reqwest::Error) -> DaError {
    match DaError::from(err) {
        DaError::ProviderUnavailable { message, .. } => DaError::ProviderUnavailable {
            provider: provider.to_string(),
            message,
        },
        other => other,
    }
}

fn parse_retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn check_status(provider: &str, resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let retry_after = parse_retry_after(&resp);
    let txt = resp.text().await.unwrap_or_default();
    Err(classify_failure(provider, status, retry_after, &txt))
}

fn clip(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn build_http(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DaError::Configuration {
            key: "http_client".to_string(),
            reason: e.to_string(),
        })
}

/// 从 base url 中取出主机名作为提供方标签
pub fn provider_label(base_url: &str) -> String {
    let without_scheme = base_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(base_url);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    if host.is_empty() {
        "unknown".to_string()
    } else {
        host.to_string()
    }
}

// ========== API key hygiene ==========

/// 去掉粘贴时常见的空白与换行
pub fn normalize_api_key(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

pub fn api_key_looks_valid(key: &str, expected_prefix: Option<&str>) -> bool {
    if key.len() < MIN_API_KEY_LEN {
        return false;
    }
    match expected_prefix {
        Some(prefix) => key.starts_with(prefix),
        None => true,
    }
}

// ========== OpenAI-compatible (covers Groq, OpenAI, DeepSeek) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String, // e.g. https://api.groq.com/openai
    pub api_key: String,  // Bearer token
    pub model: String,    // e.g. llama3-8b-8192
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
    provider: String,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Result<Self> {
        Ok(Self {
            http: build_http(cfg.timeout)?,
            provider: provider_label(&cfg.base_url),
            cfg,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.cfg.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OaiChatReq<'a> {
    model: &'a str,
    messages: Vec<OaiChatReqMsg<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OaiChatResp {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OaiChatRespChoice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    #[instrument(skip(self, prompt), fields(provider = %self.provider, mode = %prompt.mode))]
    async fn complete(&self, prompt: &PromptRequest) -> Result<LlmResponse> {
        let started = Instant::now();
        let body = OaiChatReq {
            model: &self.cfg.model,
            messages: vec![
                OaiChatReqMsg {
                    role: "system",
                    content: &prompt.system,
                },
                OaiChatReqMsg {
                    role: "user",
                    content: &prompt.prompt,
                },
            ],
            temperature: prompt.temperature,
            max_tokens: prompt.max_tokens,
        };

        let resp = self
            .http
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.provider, e))?;
        let resp = check_status(&self.provider, resp).await?;

        let data: OaiChatResp = resp
            .json()
            .await
            .map_err(|e| transport_error(&self.provider, e))?;
        let text = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(latency_ms, chars = text.len(), "completion received");

        Ok(LlmResponse {
            text,
            model: data.model.unwrap_or_else(|| self.cfg.model.clone()),
            prompt_tokens: data.usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: data.usage.as_ref().and_then(|u| u.completion_tokens),
            latency_ms,
            success: true,
        })
    }

    #[instrument(skip(self), fields(provider = %self.provider))]
    async fn health_check(&self) -> Result<()> {
        let resp = self
            .http
            .get(self.endpoint("models"))
            .bearer_auth(&self.cfg.api_key)
            .send()
            .await
            .map_err(|e| transport_error(&self.provider, e))?;
        check_status(&self.provider, resp).await?;
        Ok(())
    }
}

// ========== Anthropic (Claude) ==========

#[derive(Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,   // e.g. claude-3-5-sonnet-latest
    pub api_url: String, // default https://api.anthropic.com
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(cfg: AnthropicConfig) -> Result<Self> {
        Ok(Self {
            http: build_http(cfg.timeout)?,
            cfg,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.cfg.api_url.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct AnthMessageContent<'a> {
    r#type: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct AnthMessageReqMsg<'a> {
    role: &'static str,
    content: Vec<AnthMessageContent<'a>>,
}

#[derive(Serialize)]
struct AnthMessageReq<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<AnthMessageReqMsg<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct AnthMessageRespContent {
    #[allow(dead_code)]
    r#type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthMessageResp {
    #[serde(default)]
    model: Option<String>,
    content: Vec<AnthMessageRespContent>,
    #[serde(default)]
    usage: Option<AnthUsage>,
}

#[async_trait]
impl ChatModel for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, prompt), fields(mode = %prompt.mode))]
    async fn complete(&self, prompt: &PromptRequest) -> Result<LlmResponse> {
        let started = Instant::now();
        let body = AnthMessageReq {
            model: &self.cfg.model,
            system: &prompt.system,
            messages: vec![AnthMessageReqMsg {
                role: "user",
                content: vec![AnthMessageContent {
                    r#type: "text",
                    text: &prompt.prompt,
                }],
            }],
            max_tokens: prompt.max_tokens,
            temperature: prompt.temperature,
        };

        let resp = self
            .http
            .post(self.endpoint("messages"))
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        let resp = check_status(self.provider(), resp).await?;

        let data: AnthMessageResp = resp
            .json()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        let mut out = String::new();
        for c in data.content.into_iter() {
            if let Some(t) = c.text {
                out.push_str(&t);
            }
        }
        Ok(LlmResponse {
            text: out,
            model: data.model.unwrap_or_else(|| self.cfg.model.clone()),
            prompt_tokens: data.usage.as_ref().and_then(|u| u.input_tokens),
            completion_tokens: data.usage.as_ref().and_then(|u| u.output_tokens),
            latency_ms: started.elapsed().as_millis() as u64,
            success: true,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .http
            .get(self.endpoint("models"))
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .send()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        check_status(self.provider(), resp).await?;
        Ok(())
    }
}

// ========== Provider Factory & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "anthropic")]
    Anthropic {
        api_url: Option<String>,
        api_key: String,
        model: String,
    },
}

pub fn make_chat_model(
    chat: ChatProviderConfig,
    timeout: Duration,
    retry: RetryPolicy,
) -> Result<Arc<dyn ChatModel>> {
    let model: Arc<dyn ChatModel> = match chat {
        ChatProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            model,
            timeout,
        })?),
        ChatProviderConfig::Anthropic {
            api_url,
            api_key,
            model,
        } => Arc::new(AnthropicClient::new(AnthropicConfig {
            api_url: api_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            api_key,
            model,
            timeout,
        })?),
    };

    if retry.is_enabled() {
        Ok(Arc::new(RetryingChatModel::new(model, retry)))
    } else {
        Ok(model)
    }
}
