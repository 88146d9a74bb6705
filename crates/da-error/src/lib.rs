use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
};

/// 文档助手统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum DaError {
    // === 调用方错误 ===
    #[error("unsupported document format for '{file_name}' (detected: {detected})")]
    UnsupportedFormat { file_name: String, detected: String },

    #[error("document is {size} bytes, the limit is {limit} bytes")]
    DocumentTooLarge { size: u64, limit: u64 },

    #[error("could not decode '{file_name}': {reason}")]
    DecodingError { file_name: String, reason: String },

    #[error("no usable text could be extracted from '{file_name}'")]
    EmptyDocument { file_name: String },

    #[error("a non-empty question is required")]
    MissingQuestion,

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    // === 模型服务错误 ===
    #[error("rate limited by {provider}: {message}")]
    RateLimited {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<Duration>,
    },

    #[error("authentication with {provider} failed: {message}")]
    AuthenticationFailed { provider: String, message: String },

    #[error("{provider} is unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("{provider} rejected the request: {message}")]
    InvalidRequest { provider: String, message: String },

    #[error("{provider} returned an empty response")]
    EmptyResponse { provider: String },

    #[error("no valid challenge questions could be parsed ({discarded} discarded)")]
    ChallengeGenerationFailed { discarded: usize },

    // === 系统错误 ===
    #[error("configuration error: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的调用方错误
    Medium,   // 上游暂时性故障
    High,     // 需要人工关注
    Critical, // 系统级严重错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub document_id: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::HashMap<String, String>,
}

impl DaError {
    /// 稳定的机器可读错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            DaError::UnsupportedFormat { .. } => "unsupported_format",
            DaError::DocumentTooLarge { .. } => "document_too_large",
            DaError::DecodingError { .. } => "decoding_error",
            DaError::EmptyDocument { .. } => "empty_document",
            DaError::MissingQuestion => "missing_question",
            DaError::Validation { .. } => "validation",
            DaError::DocumentNotFound { .. } => "document_not_found",
            DaError::RateLimited { .. } => "rate_limited",
            DaError::AuthenticationFailed { .. } => "authentication_failed",
            DaError::ProviderUnavailable { .. } => "provider_unavailable",
            DaError::InvalidRequest { .. } => "invalid_request",
            DaError::EmptyResponse { .. } => "empty_response",
            DaError::ChallengeGenerationFailed { .. } => "challenge_generation_failed",
            DaError::Configuration { .. } => "configuration",
            DaError::Internal { .. } => "internal",
        }
    }

    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DaError::UnsupportedFormat { .. }
            | DaError::DocumentTooLarge { .. }
            | DaError::DecodingError { .. }
            | DaError::EmptyDocument { .. }
            | DaError::MissingQuestion
            | DaError::Validation { .. }
            | DaError::DocumentNotFound { .. } => ErrorSeverity::Low,
            DaError::RateLimited { .. }
            | DaError::ProviderUnavailable { .. }
            | DaError::EmptyResponse { .. }
            | DaError::ChallengeGenerationFailed { .. } => ErrorSeverity::Medium,
            DaError::AuthenticationFailed { .. } | DaError::InvalidRequest { .. } => {
                ErrorSeverity::High
            }
            DaError::Configuration { .. } | DaError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// 调用方是否是过错方（4xx）
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.to_http_status()) && !matches!(self, DaError::RateLimited { .. })
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DaError::RateLimited { .. } | DaError::ProviderUnavailable { .. }
        )
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DaError::RateLimited { retry_after, .. } => {
                Some(retry_after.unwrap_or(Duration::from_secs(1)))
            }
            DaError::ProviderUnavailable { .. } => Some(Duration::from_millis(500)),
            _ => None,
        }
    }

    /// 记录错误日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    document_id = ?metadata.document_id,
                    kind = self.kind(),
                    error = %self,
                    "request rejected"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    document_id = ?metadata.document_id,
                    kind = self.kind(),
                    error = %self,
                    context = ?metadata.context,
                    "upstream failure"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    document_id = ?metadata.document_id,
                    kind = self.kind(),
                    error = %self,
                    context = ?metadata.context,
                    severity = ?metadata.severity,
                    "serious failure"
                );
            }
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            DaError::UnsupportedFormat { .. } => 415,
            DaError::DocumentTooLarge { .. } => 413,
            DaError::DecodingError { .. } | DaError::EmptyDocument { .. } => 422,
            DaError::MissingQuestion | DaError::Validation { .. } => 400,
            DaError::DocumentNotFound { .. } => 404,
            DaError::RateLimited { .. } => 429,
            DaError::AuthenticationFailed { .. }
            | DaError::InvalidRequest { .. }
            | DaError::EmptyResponse { .. }
            | DaError::ChallengeGenerationFailed { .. } => 502,
            DaError::ProviderUnavailable { .. } => 503,
            DaError::Configuration { .. } | DaError::Internal { .. } => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            DaError::UnsupportedFormat { .. } => {
                "Unsupported file type. Please upload a PDF or TXT file.".to_string()
            }
            DaError::DocumentTooLarge { limit, .. } => format!(
                "File too large. Maximum size is {} MB.",
                limit / (1024 * 1024)
            ),
            DaError::DecodingError { .. } => {
                "The file could not be read. Make sure it is a valid PDF or UTF-8 text file."
                    .to_string()
            }
            DaError::EmptyDocument { .. } => {
                "The file appears to be empty or unreadable.".to_string()
            }
            DaError::MissingQuestion => "Please enter a question.".to_string(),
            DaError::Validation { message } => message.clone(),
            DaError::DocumentNotFound { .. } => {
                "No document uploaded yet, or the session has expired.".to_string()
            }
            DaError::RateLimited { .. } => {
                "The language model quota or rate limit was exceeded. Please wait a moment and try again."
                    .to_string()
            }
            DaError::AuthenticationFailed { .. } => {
                "The language model API key is invalid or missing.".to_string()
            }
            DaError::ProviderUnavailable { .. } => {
                "The language model service is unavailable or timed out. Please try again."
                    .to_string()
            }
            DaError::InvalidRequest { .. } => {
                "The language model rejected the request.".to_string()
            }
            DaError::EmptyResponse { .. } => {
                "The language model returned an empty response.".to_string()
            }
            DaError::ChallengeGenerationFailed { .. } => {
                "Could not generate challenge questions. Please try again.".to_string()
            }
            DaError::Configuration { .. } | DaError::Internal { .. } => {
                "Internal server error.".to_string()
            }
        }
    }
}

/// 创建错误元数据的便捷构造器
pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                document_id: None,
                request_id: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::HashMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn document_id(mut self, document_id: &str) -> Self {
        self.metadata.document_id = Some(document_id.to_string());
        self
    }

    pub fn request_id(mut self, request_id: &str) -> Self {
        self.metadata.request_id = Some(request_id.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &DaError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, DaError>;

// === 转换实现 ===

impl From<serde_json::Error> for DaError {
    fn from(err: serde_json::Error) -> Self {
        DaError::Internal {
            message: "json serialization failed".to_string(),
            details: Some(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for DaError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else if err.is_decode() {
            format!("malformed response body: {}", err)
        } else {
            err.to_string()
        };
        DaError::ProviderUnavailable {
            provider: "http".to_string(),
            message,
        }
    }
}

impl From<uuid::Error> for DaError {
    fn from(err: uuid::Error) -> Self {
        DaError::Validation {
            message: format!("invalid document id: {}", err),
        }
    }
}

impl From<tokio::task::JoinError> for DaError {
    fn from(err: tokio::task::JoinError) -> Self {
        DaError::Internal {
            message: "background task failed".to_string(),
            details: Some(err.to_string()),
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for DaError {
    fn into_response(self) -> axum::response::Response {
        let status_code = StatusCode::from_u16(self.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "message": self.user_message()
        });

        let mut response = (status_code, Json(body)).into_response();
        if let DaError::RateLimited {
            retry_after: Some(after),
            ..
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(&after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors_map_to_4xx() {
        let errors = vec![
            DaError::UnsupportedFormat {
                file_name: "a.docx".into(),
                detected: "docx".into(),
            },
            DaError::DocumentTooLarge {
                size: 10,
                limit: 5,
            },
            DaError::DecodingError {
                file_name: "a.txt".into(),
                reason: "bad utf-8".into(),
            },
            DaError::EmptyDocument {
                file_name: "a.pdf".into(),
            },
            DaError::MissingQuestion,
            DaError::DocumentNotFound {
                document_id: "x".into(),
            },
        ];
        for e in errors {
            assert!(e.is_client_error(), "{} should be a client error", e.kind());
            assert_eq!(e.severity(), ErrorSeverity::Low);
        }
    }

    #[test]
    fn test_provider_errors_map_to_5xx() {
        let unavailable = DaError::ProviderUnavailable {
            provider: "groq".into(),
            message: "502".into(),
        };
        assert_eq!(unavailable.to_http_status(), 503);
        assert!(unavailable.is_retryable());

        let auth = DaError::AuthenticationFailed {
            provider: "groq".into(),
            message: "bad key".into(),
        };
        assert_eq!(auth.to_http_status(), 502);
        assert!(!auth.is_retryable());
        assert!(!auth.is_client_error());

        let failed = DaError::ChallengeGenerationFailed { discarded: 3 };
        assert_eq!(failed.to_http_status(), 502);
    }

    #[test]
    fn test_rate_limited_retry_after() {
        let limited = DaError::RateLimited {
            provider: "groq".into(),
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(limited.to_http_status(), 429);
        assert!(!limited.is_client_error());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));

        let unknown = DaError::RateLimited {
            provider: "groq".into(),
            message: "quota".into(),
            retry_after: None,
        };
        assert_eq!(unknown.retry_after(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_metadata_builder_takes_severity_from_error() {
        let err = DaError::Configuration {
            key: "GROQ_API_KEY".into(),
            reason: "missing".into(),
        };
        let meta = ErrorMetadataBuilder::new("api")
            .operation("startup")
            .context("env", "test")
            .build(&err);
        assert_eq!(meta.severity, ErrorSeverity::Critical);
        assert_eq!(meta.operation.as_deref(), Some("startup"));
        assert_eq!(meta.context.get("env").map(String::as_str), Some("test"));
    }

    #[test]
    fn test_too_large_message_names_limit() {
        let err = DaError::DocumentTooLarge {
            size: 60 * 1024 * 1024,
            limit: 50 * 1024 * 1024,
        };
        assert!(err.user_message().contains("50 MB"));
    }
}
