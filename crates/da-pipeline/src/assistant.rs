use crate::extractor::{self, ExtractorLimits};
use crate::parser;
use crate::prompt::{require_question, PromptBudget, PromptBuilder};
use crate::store::{DocumentSession, DocumentStore, StoreConfig};
use chrono::{DateTime, Utc};
use da_core::{
    AnswerSubmission, ChallengeQuestion, DocumentId, GradedAnswer, Mode, ParsedResult,
    PromptRequest, UploadedDocument, CHOICE_COUNT,
};
use da_error::{DaError, Result};
use da_llm::ChatModel;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// 上传后返回的预览长度
pub const DEFAULT_PREVIEW_CHARS: usize = 500;

/// 编排层配置
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub limits: ExtractorLimits,
    pub budget: PromptBudget,
    pub store: StoreConfig,
    pub summarize_on_upload: bool,
    pub preview_chars: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            limits: ExtractorLimits::default(),
            budget: PromptBudget::default(),
            store: StoreConfig::default(),
            summarize_on_upload: true,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

// ========== Outcomes ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub document_id: DocumentId,
    pub file_name: String,
    pub characters: usize,
    pub pages: usize,
    pub preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// 自动摘要失败时的提示；上传本身仍然成功
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryOutcome {
    pub document_id: DocumentId,
    pub summary: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerOutcome {
    pub document_id: DocumentId,
    pub question: String,
    pub answer: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeOutcome {
    pub document_id: DocumentId,
    pub questions: Vec<ChallengeQuestion>,
    pub discarded: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub document_id: DocumentId,
    pub results: Vec<GradedAnswer>,
    pub correct: usize,
    pub total: usize,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOverview {
    pub document_id: DocumentId,
    pub file_name: String,
    pub characters: usize,
    pub pages: usize,
    pub preview: String,
    pub summary: Option<String>,
    pub challenge_questions: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ========== Orchestrator ==========

/// 文档问答编排：抽取 → 构造提示 → 调用模型 → 解析
pub struct DocumentAssistant {
    model: Arc<dyn ChatModel>,
    builder: PromptBuilder,
    store: DocumentStore,
    limits: ExtractorLimits,
    summarize_on_upload: bool,
    preview_chars: usize,
}

impl DocumentAssistant {
    pub fn new(model: Arc<dyn ChatModel>, config: AssistantConfig) -> Self {
        Self {
            model,
            builder: PromptBuilder::new(config.budget),
            store: DocumentStore::new(config.store),
            limits: config.limits,
            summarize_on_upload: config.summarize_on_upload,
            preview_chars: config.preview_chars,
        }
    }

    pub fn provider(&self) -> &str {
        self.model.provider()
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn limits(&self) -> &ExtractorLimits {
        &self.limits
    }

    /// 上传新文档，或用 `replace` 指定的句柄替换已有文档
    #[instrument(skip(self, document), fields(file_name = %document.file_name, size = document.size()))]
    pub async fn upload(
        &self,
        document: UploadedDocument,
        replace: Option<DocumentId>,
    ) -> Result<UploadOutcome> {
        extractor::precheck(&document, &self.limits)?;
        if let Some(id) = replace {
            self.store.get(id).await?;
        }

        let limits = self.limits;
        let text =
            tokio::task::spawn_blocking(move || extractor::extract(document, &limits)).await??;
        let file_name = text.source.clone();
        let characters = text.char_count;
        let pages = text.pages;
        let preview = text.preview(self.preview_chars);

        let document_id = match replace {
            Some(id) => {
                self.store.replace(id, text).await?;
                id
            }
            None => self.store.insert(text).await,
        };
        info!(%document_id, characters, pages, "document stored");

        let mut outcome = UploadOutcome {
            document_id,
            file_name,
            characters,
            pages,
            preview,
            summary: None,
            summary_error: None,
        };

        if self.summarize_on_upload {
            let session = self.store.get(document_id).await?;
            match self.summarize_session(&session).await {
                Ok((summary, _)) => outcome.summary = Some(summary),
                Err(e) => {
                    warn!(%document_id, kind = e.kind(), error = %e, "summary on upload failed");
                    outcome.summary_error = Some(e.user_message());
                }
            }
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn summarize(&self, document_id: DocumentId) -> Result<SummaryOutcome> {
        let session = self.store.get(document_id).await?;
        let (summary, truncated) = self.summarize_session(&session).await?;
        Ok(SummaryOutcome {
            document_id,
            summary,
            truncated,
        })
    }

    #[instrument(skip(self, question))]
    pub async fn ask(&self, document_id: DocumentId, question: &str) -> Result<AnswerOutcome> {
        let question = require_question(Some(question))?;
        let session = self.store.get(document_id).await?;
        let prompt = self
            .builder
            .build(&session.text, Mode::Ask, Some(question))?;
        let answer = self.complete_text(&prompt).await?;
        Ok(AnswerOutcome {
            document_id,
            question: question.to_string(),
            answer,
            truncated: prompt.truncated,
        })
    }

    #[instrument(skip(self))]
    pub async fn challenge(&self, document_id: DocumentId) -> Result<ChallengeOutcome> {
        let session = self.store.get(document_id).await?;
        let prompt = self.builder.build(&session.text, Mode::Challenge, None)?;
        let response = self.model.complete(&prompt).await?;
        debug!(latency_ms = response.latency_ms, "challenge completion received");

        match parser::parse(&response, Mode::Challenge, self.model.provider())? {
            ParsedResult::Challenge {
                questions,
                discarded,
            } => {
                self.store
                    .set_challenge(document_id, session.revision, questions.clone())
                    .await?;
                Ok(ChallengeOutcome {
                    document_id,
                    questions,
                    discarded,
                    truncated: prompt.truncated,
                })
            }
            ParsedResult::Text { .. } => Err(unexpected_shape(Mode::Challenge)),
        }
    }

    /// 本地判分，再请模型给出讲解
    #[instrument(skip(self, submissions), fields(answers = submissions.len()))]
    pub async fn evaluate(
        &self,
        document_id: DocumentId,
        submissions: Vec<AnswerSubmission>,
    ) -> Result<EvaluationOutcome> {
        if submissions.is_empty() {
            return Err(DaError::Validation {
                message: "no answers were submitted".to_string(),
            });
        }
        let session = self.store.get(document_id).await?;
        if session.challenge.is_empty() {
            return Err(DaError::Validation {
                message: "no challenge questions have been generated for this document"
                    .to_string(),
            });
        }

        let graded = grade(&session.challenge, &submissions)?;
        let pairs: Vec<(&ChallengeQuestion, &GradedAnswer)> = graded
            .iter()
            .map(|g| (&session.challenge[g.question_index], g))
            .collect();
        let prompt = self.builder.build_evaluation(&session.text, &pairs);
        let feedback = self.complete_text(&prompt).await?;

        let correct = graded.iter().filter(|g| g.correct).count();
        info!(%document_id, correct, total = graded.len(), "answers graded");
        Ok(EvaluationOutcome {
            document_id,
            total: graded.len(),
            correct,
            results: graded,
            feedback,
        })
    }

    pub async fn document(&self, document_id: DocumentId) -> Result<DocumentOverview> {
        let session = self.store.get(document_id).await?;
        Ok(DocumentOverview {
            document_id,
            file_name: session.text.source.clone(),
            characters: session.text.char_count,
            pages: session.text.pages,
            preview: session.text.preview(self.preview_chars),
            summary: session.summary,
            challenge_questions: session.challenge.len(),
            created_at: session.created_at,
            expires_at: session.expires_at,
        })
    }

    pub async fn health(&self) -> Result<()> {
        self.model.health_check().await
    }

    async fn summarize_session(&self, session: &DocumentSession) -> Result<(String, bool)> {
        let prompt = self.builder.build(&session.text, Mode::Summarize, None)?;
        let summary = self.complete_text(&prompt).await?;
        self.store
            .set_summary(session.id, session.revision, summary.clone())
            .await?;
        Ok((summary, prompt.truncated))
    }

    async fn complete_text(&self, prompt: &PromptRequest) -> Result<String> {
        let response = self.model.complete(prompt).await?;
        debug!(
            mode = %prompt.mode,
            latency_ms = response.latency_ms,
            truncated = prompt.truncated,
            "completion received"
        );
        match parser::parse(&response, prompt.mode, self.model.provider())? {
            ParsedResult::Text { text } => Ok(text),
            ParsedResult::Challenge { .. } => Err(unexpected_shape(prompt.mode)),
        }
    }
}

fn grade(
    challenge: &[ChallengeQuestion],
    submissions: &[AnswerSubmission],
) -> Result<Vec<GradedAnswer>> {
    let mut seen = HashSet::new();
    let mut graded = Vec::with_capacity(submissions.len());
    for s in submissions {
        let question = challenge
            .get(s.question_index)
            .ok_or_else(|| DaError::Validation {
                message: format!(
                    "question index {} out of range (0..{})",
                    s.question_index,
                    challenge.len()
                ),
            })?;
        if s.selected >= CHOICE_COUNT {
            return Err(DaError::Validation {
                message: format!(
                    "selected choice {} out of range (0..{})",
                    s.selected, CHOICE_COUNT
                ),
            });
        }
        if !seen.insert(s.question_index) {
            return Err(DaError::Validation {
                message: format!("question {} answered more than once", s.question_index),
            });
        }
        graded.push(GradedAnswer {
            question_index: s.question_index,
            question: question.question().to_string(),
            selected: s.selected,
            correct_index: question.correct_index(),
            correct: s.selected == question.correct_index(),
        });
    }
    Ok(graded)
}

fn unexpected_shape(mode: Mode) -> DaError {
    DaError::Internal {
        message: format!("unexpected parse result for mode {}", mode),
        details: None,
    }
}
