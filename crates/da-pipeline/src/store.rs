use chrono::{DateTime, Utc};
use da_core::{ChallengeQuestion, DocumentId, ExtractedText};
use da_error::{DaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreConfig {
    pub ttl: Duration,
    pub max_documents: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_documents: 256,
        }
    }
}

/// 一次上传对应的会话状态；替换文档时摘要和挑战题一并清空
#[derive(Debug, Clone)]
pub struct DocumentSession {
    pub id: DocumentId,
    pub text: Arc<ExtractedText>,
    pub summary: Option<String>,
    pub challenge: Vec<ChallengeQuestion>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DocumentSession {
    fn new(id: DocumentId, text: ExtractedText, ttl: Duration, revision: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            text: Arc::new(text),
            summary: None,
            challenge: Vec::new(),
            revision,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// 进程内的文档会话存储，由应用状态持有
pub struct DocumentStore {
    sessions: RwLock<HashMap<DocumentId, DocumentSession>>,
    cfg: StoreConfig,
}

impl DocumentStore {
    pub fn new(cfg: StoreConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            cfg,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// 新建会话，返回文档句柄
    pub async fn insert(&self, text: ExtractedText) -> DocumentId {
        let id = Uuid::new_v4();
        let mut sessions = self.sessions.write().await;
        purge_locked(&mut sessions);
        while sessions.len() >= self.cfg.max_documents.max(1) {
            let oldest = sessions
                .values()
                .min_by_key(|s| s.created_at)
                .map(|s| s.id);
            match oldest {
                Some(old) => {
                    sessions.remove(&old);
                    debug!(document_id = %old, "evicted oldest document session");
                }
                None => break,
            }
        }
        sessions.insert(id, DocumentSession::new(id, text, self.cfg.ttl, 0));
        id
    }

    /// 用新文档替换已有会话，清空缓存并刷新有效期，返回新的版本号
    pub async fn replace(&self, id: DocumentId, text: ExtractedText) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        purge_locked(&mut sessions);
        let revision = match sessions.get(&id) {
            Some(existing) => existing.revision + 1,
            None => return Err(not_found(id)),
        };
        sessions.insert(id, DocumentSession::new(id, text, self.cfg.ttl, revision));
        Ok(revision)
    }

    /// 返回会话快照；过期会话视为不存在
    pub async fn get(&self, id: DocumentId) -> Result<DocumentSession> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(&id) {
                Some(s) if !s.is_expired() => return Ok(s.clone()),
                Some(_) => {}
                None => return Err(not_found(id)),
            }
        }
        self.sessions.write().await.remove(&id);
        Err(not_found(id))
    }

    /// 仅当会话仍是同一版本时写入摘要，避免旧文档的结果覆盖新文档
    pub async fn set_summary(&self, id: DocumentId, revision: u64, summary: String) -> Result<()> {
        self.update(id, revision, |s| s.summary = Some(summary)).await
    }

    pub async fn set_challenge(
        &self,
        id: DocumentId,
        revision: u64,
        questions: Vec<ChallengeQuestion>,
    ) -> Result<()> {
        self.update(id, revision, |s| s.challenge = questions).await
    }

    pub async fn purge_expired(&self) -> usize {
        purge_locked(&mut *self.sessions.write().await)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn update<F>(&self, id: DocumentId, revision: u64, apply: F) -> Result<()>
    where
        F: FnOnce(&mut DocumentSession),
    {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(s) if !s.is_expired() => {
                if s.revision == revision {
                    apply(s);
                } else {
                    debug!(document_id = %id, "document replaced meanwhile, result not cached");
                }
                Ok(())
            }
            _ => Err(not_found(id)),
        }
    }
}

fn purge_locked(sessions: &mut HashMap<DocumentId, DocumentSession>) -> usize {
    let before = sessions.len();
    sessions.retain(|_, s| !s.is_expired());
    before - sessions.len()
}

fn not_found(id: DocumentId) -> DaError {
    DaError::DocumentNotFound {
        document_id: id.to_string(),
    }
}
