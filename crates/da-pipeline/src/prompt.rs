//! 各模式的提示模板与字符预算。
//!
//! 文档过长时只保留前 N 个字符，并在提示里明确告诉模型上下文不完整，
//! 调用方通过 `PromptRequest::truncated` 得知这一点。

use da_core::{ChallengeQuestion, ExtractedText, GradedAnswer, Mode, PromptRequest, CHOICE_LABELS};
use da_error::{DaError, Result};
use serde::{Deserialize, Serialize};

pub const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a careful assistant that summarizes documents faithfully.";

pub const ASK_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer using only the provided document. \
If the answer is not in the document, say so clearly.";

pub const CHALLENGE_SYSTEM_PROMPT: &str =
    "You write multiple-choice reading comprehension questions and follow the requested output format exactly.";

pub const EVALUATE_SYSTEM_PROMPT: &str =
    "You are a supportive tutor giving brief, accurate feedback on comprehension answers.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptBudget {
    pub summary_chars: usize,
    pub ask_chars: usize,
    pub challenge_chars: usize,
    pub evaluate_chars: usize,
    pub challenge_count: usize,
}

impl Default for PromptBudget {
    fn default() -> Self {
        Self {
            summary_chars: 4000,
            ask_chars: 4000,
            challenge_chars: 3000,
            evaluate_chars: 2000,
            challenge_count: 5,
        }
    }
}

impl PromptBudget {
    pub fn chars_for(&self, mode: Mode) -> usize {
        match mode {
            Mode::Summarize => self.summary_chars,
            Mode::Ask => self.ask_chars,
            Mode::Challenge => self.challenge_chars,
            Mode::Evaluate => self.evaluate_chars,
        }
    }
}

/// 返回去掉首尾空白后的问题；空问题直接拒绝
pub fn require_question(question: Option<&str>) -> Result<&str> {
    match question.map(str::trim) {
        Some(q) if !q.is_empty() => Ok(q),
        _ => Err(DaError::MissingQuestion),
    }
}

/// 按字符截断，返回片段以及是否发生截断
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (&text[..idx], true),
        None => (text, false),
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    budget: PromptBudget,
}

impl PromptBuilder {
    pub fn new(budget: PromptBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &PromptBudget {
        &self.budget
    }

    pub fn build(
        &self,
        text: &ExtractedText,
        mode: Mode,
        question: Option<&str>,
    ) -> Result<PromptRequest> {
        // 先校验问题，避免无谓的字符串处理
        let question = match mode {
            Mode::Ask => Some(require_question(question)?.to_string()),
            _ => None,
        };
        let (excerpt, truncated) = self.excerpt(text, mode);

        let request = match mode {
            Mode::Summarize => PromptRequest {
                mode,
                system: SUMMARY_SYSTEM_PROMPT.to_string(),
                prompt: format!(
                    "Summarize the following document in no more than 150 words. \
                     Focus on key ideas, main points, and important details.\n\n{}",
                    excerpt
                ),
                question: None,
                truncated,
                temperature: 0.3,
                max_tokens: 200,
            },
            Mode::Ask => {
                let q = question.unwrap_or_default();
                PromptRequest {
                    mode,
                    system: ASK_SYSTEM_PROMPT.to_string(),
                    prompt: format!(
                        "Based only on the document below, answer the user's question accurately and concisely. \
                         If the answer is not in the document, say so clearly.\n\n\
                         Document:\n{}\n\nQuestion: {}\n\nAnswer:",
                        excerpt, q
                    ),
                    question: Some(q),
                    truncated,
                    temperature: 0.2,
                    max_tokens: 300,
                }
            }
            Mode::Challenge => PromptRequest {
                mode,
                system: CHALLENGE_SYSTEM_PROMPT.to_string(),
                prompt: challenge_prompt(self.budget.challenge_count, &excerpt),
                question: None,
                truncated,
                temperature: 0.4,
                max_tokens: 800,
            },
            Mode::Evaluate => {
                return Err(DaError::Internal {
                    message: "evaluation prompts are built from graded answers".to_string(),
                    details: None,
                })
            }
        };
        Ok(request)
    }

    /// 评估提示：文档摘录加上已判分的题目与作答
    pub fn build_evaluation(
        &self,
        text: &ExtractedText,
        graded: &[(&ChallengeQuestion, &GradedAnswer)],
    ) -> PromptRequest {
        let (excerpt, truncated) = self.excerpt(text, Mode::Evaluate);
        let mut items = Vec::with_capacity(graded.len());
        for (question, answer) in graded {
            let selected = question
                .choices()
                .get(answer.selected)
                .map(String::as_str)
                .unwrap_or("(no answer)");
            items.push(format!(
                "Question {}: {}\nUser Answer: {}) {}\nCorrect Answer: {}) {}\nResult: {}\n",
                answer.question_index + 1,
                question.question(),
                CHOICE_LABELS.get(answer.selected).copied().unwrap_or('?'),
                selected,
                question.correct_label(),
                question.correct_choice(),
                if answer.correct { "correct" } else { "incorrect" },
            ));
        }

        PromptRequest {
            mode: Mode::Evaluate,
            system: EVALUATE_SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Give feedback on the user's answers to these questions about the document. \
                 For each question, briefly explain why the correct answer is right, using the document. \
                 Format your response as:\n\n\
                 Question 1: Correct / Incorrect\nFeedback: [brief explanation]\n\n\
                 Then provide an overall score and summary.\n\n\
                 Document excerpt:\n{}\n\nQuestions and answers:\n{}",
                excerpt,
                items.join("\n")
            ),
            question: None,
            truncated,
            temperature: 0.2,
            max_tokens: 600,
        }
    }

    fn excerpt(&self, text: &ExtractedText, mode: Mode) -> (String, bool) {
        let budget = self.budget.chars_for(mode);
        let (head, truncated) = truncate_chars(&text.content, budget);
        if truncated {
            (
                format!(
                    "[Note: the document is {} characters long; only the first {} characters are included, so the context is partial.]\n\n{}",
                    text.char_count, budget, head
                ),
                true,
            )
        } else {
            (head.to_string(), false)
        }
    }
}

fn challenge_prompt(count: usize, excerpt: &str) -> String {
    format!(
        "Based on the following document, create exactly {count} multiple-choice questions \
         to test comprehension. For each question, provide 4 options (A, B, C, D) \
         and indicate the correct answer. Format your response exactly as:\n\n\
         Question 1: [question text]\n\
         A) [option A]\n\
         B) [option B]\n\
         C) [option C]\n\
         D) [option D]\n\
         Correct Answer: [A/B/C/D]\n\n\
         Continue this format for all {count} questions, numbering them in order. \
         All four options of a question must be different. Do not add any other text.\n\n\
         Document:\n{excerpt}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str) -> ExtractedText {
        ExtractedText::new(content.to_string(), "sample.txt", 1).unwrap()
    }

    #[test]
    fn test_summarize_embeds_text() {
        let p = PromptBuilder::default()
            .build(&doc("The sky is blue."), Mode::Summarize, None)
            .unwrap();
        assert_eq!(p.mode, Mode::Summarize);
        assert!(p.prompt.contains("The sky is blue."));
        assert!(p.prompt.contains("150 words"));
        assert!(!p.truncated);
        assert_eq!(p.max_tokens, 200);
    }

    #[test]
    fn test_ask_requires_question() {
        let builder = PromptBuilder::default();
        let text = doc("The sky is blue.");
        for q in [None, Some(""), Some("   \n")] {
            let err = builder.build(&text, Mode::Ask, q).unwrap_err();
            assert!(matches!(err, DaError::MissingQuestion));
        }

        let p = builder
            .build(&text, Mode::Ask, Some("  What color is the sky? "))
            .unwrap();
        assert_eq!(p.question.as_deref(), Some("What color is the sky?"));
        assert!(p.prompt.contains("Question: What color is the sky?"));
        assert!(p.prompt.contains("The sky is blue."));
    }

    #[test]
    fn test_long_document_is_truncated_with_note() {
        let builder = PromptBuilder::new(PromptBudget {
            summary_chars: 10,
            ..Default::default()
        });
        let p = builder
            .build(&doc("0123456789abcdefghij"), Mode::Summarize, None)
            .unwrap();
        assert!(p.truncated);
        assert!(p.prompt.contains("0123456789"));
        assert!(!p.prompt.contains("abcdefghij"));
        assert!(p.prompt.contains("context is partial"));
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("ééééé", 2), ("éé", true));
        assert_eq!(truncate_chars("abc", 3), ("abc", false));
        assert_eq!(truncate_chars("", 0), ("", false));
    }

    #[test]
    fn test_challenge_prompt_requests_configured_count() {
        let builder = PromptBuilder::new(PromptBudget {
            challenge_count: 5,
            ..Default::default()
        });
        let p = builder
            .build(&doc("Photosynthesis converts light."), Mode::Challenge, None)
            .unwrap();
        assert!(p.prompt.contains("exactly 5 multiple-choice questions"));
        assert!(p.prompt.contains("Correct Answer: [A/B/C/D]"));
        assert!(p.question.is_none());
    }

    #[test]
    fn test_evaluation_prompt_lists_answers() {
        let q = ChallengeQuestion::new(
            "What color is the sky?".into(),
            vec!["Blue".into(), "Green".into(), "Red".into(), "Black".into()],
            0,
        )
        .unwrap();
        let graded = GradedAnswer {
            question_index: 0,
            question: q.question().to_string(),
            selected: 2,
            correct_index: 0,
            correct: false,
        };
        let p = PromptBuilder::default().build_evaluation(&doc("The sky is blue."), &[(&q, &graded)]);
        assert_eq!(p.mode, Mode::Evaluate);
        assert!(p.prompt.contains("User Answer: C) Red"));
        assert!(p.prompt.contains("Correct Answer: A) Blue"));
        assert!(p.prompt.contains("Result: incorrect"));
    }

    #[test]
    fn test_evaluation_prompt_keeps_challenge_numbering() {
        let q = ChallengeQuestion::new(
            "Which gas do plants absorb?".into(),
            vec!["Oxygen".into(), "Carbon dioxide".into(), "Helium".into(), "Neon".into()],
            1,
        )
        .unwrap();
        let graded = GradedAnswer {
            question_index: 2,
            question: q.question().to_string(),
            selected: 1,
            correct_index: 1,
            correct: true,
        };
        let p = PromptBuilder::default().build_evaluation(&doc("Plants absorb CO2."), &[(&q, &graded)]);
        assert!(p.prompt.contains("Question 3: Which gas do plants absorb?"));
        assert!(!p.prompt.contains("Question 1: Which gas"));
    }
}
