//! 文档到回答的请求流水线：抽取、提示构造、响应解析、会话存储与编排。

pub mod assistant;
pub mod extractor;
pub mod parser;
pub mod prompt;
pub mod store;

pub use assistant::{
    AnswerOutcome, AssistantConfig, ChallengeOutcome, DocumentAssistant, DocumentOverview,
    EvaluationOutcome, SummaryOutcome, UploadOutcome, DEFAULT_PREVIEW_CHARS,
};
pub use extractor::{extract, precheck, ExtractorLimits, DEFAULT_MAX_UPLOAD_BYTES, PAGE_BREAK};
pub use parser::{parse, parse_challenge};
pub use prompt::{PromptBudget, PromptBuilder};
pub use store::{DocumentSession, DocumentStore, StoreConfig};
