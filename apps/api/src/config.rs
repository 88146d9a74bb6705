use da_llm::{normalize_api_key, ChatProviderConfig, RetryPolicy};
use da_pipeline::{AssistantConfig, ExtractorLimits, PromptBudget, StoreConfig, DEFAULT_PREVIEW_CHARS};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "configs/default.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerCfg,
    pub chat_provider: ChatCfgYaml,
    pub limits: LimitsCfg,
    pub prompt: PromptBudget,
    pub session: SessionCfg,
    pub retry: RetryCfg,
    pub summarize_on_upload: bool,
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerCfg::default(),
            chat_provider: ChatCfgYaml::default(),
            limits: LimitsCfg::default(),
            prompt: PromptBudget::default(),
            session: SessionCfg::default(),
            retry: RetryCfg::default(),
            summarize_on_upload: true,
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatCfgYaml {
    pub kind: String,
    pub base_url: Option<String>,
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: String,
    /// 期望的 key 前缀，仅用于 /health/env 的格式检查
    pub api_key_prefix: Option<String>,
}

impl Default for ChatCfgYaml {
    fn default() -> Self {
        Self {
            kind: "openai_compat".to_string(),
            base_url: None,
            api_url: None,
            api_key_env: None,
            model: "llama3-8b-8192".to_string(),
            api_key_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsCfg {
    pub max_upload_bytes: u64,
    pub request_timeout_secs: u64,
}

impl Default for LimitsCfg {
    fn default() -> Self {
        Self {
            max_upload_bytes: da_pipeline::DEFAULT_MAX_UPLOAD_BYTES,
            request_timeout_secs: da_llm::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionCfg {
    pub ttl_secs: u64,
    pub max_documents: usize,
}

impl Default for SessionCfg {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_documents: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryCfg {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 1000,
        }
    }
}

impl AppConfig {
    pub fn from_yaml(s: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// 环境变量覆盖配置文件中的同名项
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MAX_UPLOAD_BYTES") {
            self.limits.max_upload_bytes = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid MAX_UPLOAD_BYTES={}: {}", v, e))?;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT_SECS") {
            self.limits.request_timeout_secs = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid REQUEST_TIMEOUT_SECS={}: {}", v, e))?;
        }
        if let Some(v) = lookup("ENVIRONMENT") {
            self.environment = v;
        }
        Ok(())
    }

    pub fn api_key_env(&self) -> String {
        self.chat_provider
            .api_key_env
            .clone()
            .unwrap_or_else(|| match self.chat_provider.kind.as_str() {
                "anthropic" => "ANTHROPIC_API_KEY".to_string(),
                _ => "GROQ_API_KEY".to_string(),
            })
    }

    /// 未显式配置时按提供方推断：Groq 为 `gsk_`，Anthropic 为 `sk-ant-`
    pub fn api_key_prefix(&self) -> Option<String> {
        if let Some(prefix) = &self.chat_provider.api_key_prefix {
            return Some(prefix.clone()).filter(|p| !p.is_empty());
        }
        match self.chat_provider.kind.as_str() {
            "anthropic" => Some("sk-ant-".to_string()),
            "openai_compat" => {
                let groq = self
                    .chat_provider
                    .base_url
                    .as_deref()
                    .map_or(true, |url| url.contains("groq.com"));
                groq.then(|| "gsk_".to_string())
            }
            _ => None,
        }
    }

    pub fn chat_provider_config(&self, api_key: &str) -> anyhow::Result<ChatProviderConfig> {
        let api_key = normalize_api_key(api_key);
        let cfg = &self.chat_provider;
        match cfg.kind.as_str() {
            "openai_compat" => Ok(ChatProviderConfig::OpenAiCompat {
                base_url: cfg
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.groq.com/openai".into()),
                api_key,
                model: cfg.model.clone(),
            }),
            "anthropic" => Ok(ChatProviderConfig::Anthropic {
                api_url: cfg.api_url.clone(),
                api_key,
                model: cfg.model.clone(),
            }),
            other => anyhow::bail!("unsupported chat provider kind={}", other),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.request_timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn assistant_config(&self) -> AssistantConfig {
        AssistantConfig {
            limits: ExtractorLimits {
                max_bytes: self.limits.max_upload_bytes,
            },
            budget: self.prompt.clone(),
            store: StoreConfig {
                ttl: Duration::from_secs(self.session.ttl_secs),
                max_documents: self.session.max_documents,
            },
            summarize_on_upload: self.summarize_on_upload,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

/// 读取 `DA_CONFIG` 指定的文件（默认 configs/default.yaml），再应用环境变量覆盖
pub fn load_config() -> anyhow::Result<AppConfig> {
    let explicit = std::env::var("DA_CONFIG").ok();
    let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let mut cfg = if explicit.is_none() && !Path::new(&path).exists() {
        warn!(path = %path, "config file not found, using defaults");
        AppConfig::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path, e))?;
        AppConfig::from_yaml(&s)?
    };
    cfg.apply_env_overrides(|k| std::env::var(k).ok())?;
    info!(
        path = %path,
        provider = %cfg.chat_provider.kind,
        model = %cfg.chat_provider.model,
        environment = %cfg.environment,
        "config loaded"
    );
    Ok(cfg)
}
