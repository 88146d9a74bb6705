use crate::{ChatModel, DaError, LlmResponse, PromptRequest, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// 退避重试策略；`max_retries = 0` 表示不重试
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// 第 `attempt` 次失败后的等待时间（从 0 开始计数）
    pub fn delay_for(&self, attempt: u32, err: &DaError) -> Duration {
        let backoff = self.base_delay.saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let wait = match err {
            DaError::RateLimited {
                retry_after: Some(after),
                ..
            } => (*after).max(backoff),
            _ => backoff,
        };
        wait.min(self.max_delay)
    }
}

/// 只对限流与上游不可用做有限次退避重试
pub struct RetryingChatModel {
    inner: Arc<dyn ChatModel>,
    policy: RetryPolicy,
}

impl RetryingChatModel {
    pub fn new(inner: Arc<dyn ChatModel>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ChatModel for RetryingChatModel {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    async fn complete(&self, prompt: &PromptRequest) -> Result<LlmResponse> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(prompt).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for(attempt, &err);
                    attempt += 1;
                    warn!(
                        provider = self.inner.provider(),
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying completion"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use da_core::Mode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedModel {
        script: Mutex<VecDeque<Result<LlmResponse>>>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<LlmResponse>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _prompt: &PromptRequest) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(LlmResponse::from_text("fallback")))
        }
    }

    fn prompt() -> PromptRequest {
        PromptRequest {
            mode: Mode::Ask,
            system: String::new(),
            prompt: "q".into(),
            question: Some("q".into()),
            truncated: false,
            temperature: 0.2,
            max_tokens: 10,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn unavailable() -> DaError {
        DaError::ProviderUnavailable {
            provider: "scripted".into(),
            message: "503".into(),
        }
    }

    #[test]
    fn test_default_policy_is_disabled() {
        assert!(!RetryPolicy::default().is_enabled());
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        let err = unavailable();
        assert_eq!(policy.delay_for(0, &err), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(350));

        let limited = DaError::RateLimited {
            provider: "p".into(),
            message: "m".into(),
            retry_after: Some(Duration::from_millis(300)),
        };
        assert_eq!(policy.delay_for(0, &limited), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let inner = Arc::new(ScriptedModel::new(vec![
            Err(unavailable()),
            Err(DaError::RateLimited {
                provider: "scripted".into(),
                message: "429".into(),
                retry_after: None,
            }),
            Ok(LlmResponse::from_text("done")),
        ]));
        let model = RetryingChatModel::new(inner.clone(), fast_policy(3));
        let resp = model.complete(&prompt()).await.unwrap();
        assert_eq!(resp.text, "done");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let inner = Arc::new(ScriptedModel::new(vec![
            Err(unavailable()),
            Err(unavailable()),
            Err(unavailable()),
        ]));
        let model = RetryingChatModel::new(inner.clone(), fast_policy(1));
        let err = model.complete(&prompt()).await.unwrap_err();
        assert!(matches!(err, DaError::ProviderUnavailable { .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let inner = Arc::new(ScriptedModel::new(vec![Err(DaError::AuthenticationFailed {
            provider: "scripted".into(),
            message: "401".into(),
        })]));
        let model = RetryingChatModel::new(inner.clone(), fast_policy(3));
        let err = model.complete(&prompt()).await.unwrap_err();
        assert!(matches!(err, DaError::AuthenticationFailed { .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
