use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

pub use da_error::{DaError as Error, Result};

/// 文档句柄，上传成功后返回给调用方
pub type DocumentId = Uuid;

/// 挑战题固定的选项数量
pub const CHOICE_COUNT: usize = 4;

/// 选项标签，与 `CHOICE_COUNT` 一一对应
pub const CHOICE_LABELS: [char; CHOICE_COUNT] = ['A', 'B', 'C', 'D'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Txt,
}

impl DocumentFormat {
    /// 根据扩展名识别格式；没有扩展名时退回到声明的 MIME 类型
    pub fn detect(file_name: &str, content_type: Option<&str>) -> Option<Self> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("pdf") => Some(DocumentFormat::Pdf),
            Some("txt") => Some(DocumentFormat::Txt),
            Some(_) => None,
            None => {
                let mime = content_type?.split(';').next()?.trim().to_ascii_lowercase();
                match mime.as_str() {
                    "application/pdf" => Some(DocumentFormat::Pdf),
                    "text/plain" => Some(DocumentFormat::Txt),
                    _ => None,
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Txt => "txt",
        }
    }
}

/// 上传的原始文件，仅在抽取期间存在
#[derive(Debug, Clone)]
pub struct UploadedDocument {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedDocument {
    pub fn new(file_name: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type,
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn format(&self) -> Option<DocumentFormat> {
        DocumentFormat::detect(&self.file_name, self.content_type.as_deref())
    }

    /// 用于错误信息的格式描述
    pub fn declared_type(&self) -> String {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .or_else(|| self.content_type.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// 抽取后的规范化文本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub content: String,
    pub source: String,
    pub char_count: usize,
    pub pages: usize,
}

impl ExtractedText {
    /// 空白文本直接视为抽取失败
    pub fn new(content: String, source: impl Into<String>, pages: usize) -> Result<Self> {
        let source = source.into();
        if content.trim().is_empty() {
            return Err(Error::EmptyDocument { file_name: source });
        }
        let char_count = content.chars().count();
        Ok(Self {
            content,
            source,
            char_count,
            pages,
        })
    }

    /// 前 `max_chars` 个字符，截断时追加省略号
    pub fn preview(&self, max_chars: usize) -> String {
        match self.content.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}...", &self.content[..idx]),
            None => self.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Summarize,
    Ask,
    Challenge,
    Evaluate,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Summarize => "summarize",
            Mode::Ask => "ask",
            Mode::Challenge => "challenge",
            Mode::Evaluate => "evaluate",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 发送给模型的完整提示
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub mode: Mode,
    pub system: String,
    pub prompt: String,
    pub question: Option<String>,
    pub truncated: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// 模型返回的原始文本与尽力而为的元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub latency_ms: u64,
    pub success: bool,
}

impl LlmResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: true,
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
struct RawChallengeQuestion {
    question: String,
    choices: Vec<String>,
    correct_index: usize,
}

impl TryFrom<RawChallengeQuestion> for ChallengeQuestion {
    type Error = Error;

    fn try_from(raw: RawChallengeQuestion) -> Result<Self> {
        ChallengeQuestion::new(raw.question, raw.choices, raw.correct_index)
    }
}

/// 单选理解题；只能通过校验构造
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawChallengeQuestion")]
pub struct ChallengeQuestion {
    question: String,
    choices: Vec<String>,
    correct_index: usize,
}

impl ChallengeQuestion {
    pub fn new(question: String, choices: Vec<String>, correct_index: usize) -> Result<Self> {
        let question = question.trim().to_string();
        if question.is_empty() {
            return Err(Error::Validation {
                message: "question text is empty".to_string(),
            });
        }
        if choices.len() != CHOICE_COUNT {
            return Err(Error::Validation {
                message: format!("expected {} choices, got {}", CHOICE_COUNT, choices.len()),
            });
        }
        let choices: Vec<String> = choices.into_iter().map(|c| c.trim().to_string()).collect();
        if choices.iter().any(|c| c.is_empty()) {
            return Err(Error::Validation {
                message: "answer choices must not be empty".to_string(),
            });
        }
        for (i, a) in choices.iter().enumerate() {
            if choices[i + 1..]
                .iter()
                .any(|b| a.to_lowercase() == b.to_lowercase())
            {
                return Err(Error::Validation {
                    message: format!("duplicate answer choice '{}'", a),
                });
            }
        }
        if correct_index >= CHOICE_COUNT {
            return Err(Error::Validation {
                message: format!("correct index {} out of range", correct_index),
            });
        }
        Ok(Self {
            question,
            choices,
            correct_index,
        })
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn choices(&self) -> &[String] {
        &self.choices
    }

    pub fn correct_index(&self) -> usize {
        self.correct_index
    }

    pub fn correct_choice(&self) -> &str {
        &self.choices[self.correct_index]
    }

    pub fn correct_label(&self) -> char {
        CHOICE_LABELS[self.correct_index]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedResult {
    Text {
        text: String,
    },
    Challenge {
        questions: Vec<ChallengeQuestion>,
        discarded: usize,
    },
}

/// 用户对某道挑战题的作答
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSubmission {
    pub question_index: usize,
    pub selected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradedAnswer {
    pub question_index: usize,
    pub question: String,
    pub selected: usize,
    pub correct_index: usize,
    pub correct: bool,
}
