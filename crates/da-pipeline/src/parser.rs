use da_core::{ChallengeQuestion, LlmResponse, Mode, ParsedResult, CHOICE_COUNT, CHOICE_LABELS};
use da_error::{DaError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// 每道题以 `Question N:` 开头，也容忍 markdown 加粗或标题前缀
static RE_QUESTION_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[ \t]*(?:[#>*]+[ \t]*)?question[ \t]+\d+[ \t]*(?:\*\*)?[ \t]*[:.)\-][ \t]*(?:\*\*)?[ \t]*")
        .unwrap()
});

static RE_CHOICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[ \t]*\(?([A-D])[ \t]*[).:][ \t]*(.+?)[ \t]*$").unwrap());

static RE_CORRECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[ \t]*(?:\*\*)?correct[ \t]+answer(?:\*\*)?[ \t]*[:\-][ \t]*(?:\*\*)?[ \t]*\(?([A-D])\b")
        .unwrap()
});

pub fn parse(response: &LlmResponse, mode: Mode, provider: &str) -> Result<ParsedResult> {
    let text = response.text.trim();
    if text.is_empty() {
        return Err(DaError::EmptyResponse {
            provider: provider.to_string(),
        });
    }
    match mode {
        Mode::Summarize | Mode::Ask | Mode::Evaluate => Ok(ParsedResult::Text {
            text: text.to_string(),
        }),
        Mode::Challenge => {
            let (questions, discarded) = parse_challenge(text);
            if questions.is_empty() {
                warn!(discarded, "challenge response contained no valid questions");
                return Err(DaError::ChallengeGenerationFailed { discarded });
            }
            if discarded > 0 {
                warn!(discarded, kept = questions.len(), "dropped malformed challenge blocks");
            }
            Ok(ParsedResult::Challenge {
                questions,
                discarded,
            })
        }
    }
}

/// 拆分题块并逐块解析，返回有效题目与丢弃的块数
pub fn parse_challenge(text: &str) -> (Vec<ChallengeQuestion>, usize) {
    let headers: Vec<_> = RE_QUESTION_HEADER.find_iter(text).collect();
    let mut questions = Vec::with_capacity(headers.len());
    let mut discarded = 0;

    // 首个题头之前出现选项，说明有题目的题头没能识别
    let preamble = &text[..headers.first().map(|h| h.start()).unwrap_or(text.len())];
    if preamble
        .lines()
        .any(|l| RE_CHOICE.is_match(l) || RE_CORRECT.is_match(l))
    {
        debug!("choice lines found before the first question header");
        discarded += 1;
    }

    for (i, header) in headers.iter().enumerate() {
        let end = headers.get(i + 1).map(|h| h.start()).unwrap_or(text.len());
        let block = &text[header.end()..end];
        match parse_block(block) {
            Some(q) => questions.push(q),
            None => {
                debug!(block = i + 1, "challenge block did not match the expected format");
                discarded += 1;
            }
        }
    }
    (questions, discarded)
}

fn parse_block(block: &str) -> Option<ChallengeQuestion> {
    let mut question_lines: Vec<&str> = Vec::new();
    let mut choices: [Option<String>; CHOICE_COUNT] = Default::default();
    let mut correct: Option<usize> = None;

    // 题头所在行的剩余部分总是题干，即使以 "A." 之类开头
    let (head, rest) = block.split_once('\n').unwrap_or((block, ""));
    let head = head.trim();
    if !head.is_empty() {
        question_lines.push(head);
    }

    for line in rest.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = RE_CORRECT.captures(line) {
            if correct.is_some() {
                return None;
            }
            correct = Some(label_index(&caps[1])?);
        } else if let Some(caps) = RE_CHOICE.captures(line) {
            let idx = label_index(&caps[1])?;
            if choices[idx].is_some() {
                return None;
            }
            choices[idx] = Some(caps[2].to_string());
        } else if choices.iter().all(Option::is_none) && correct.is_none() {
            question_lines.push(line);
        }
    }

    let choices: Vec<String> = choices.into_iter().collect::<Option<Vec<_>>>()?;
    ChallengeQuestion::new(question_lines.join(" "), choices, correct?).ok()
}

fn label_index(label: &str) -> Option<usize> {
    let c = label.chars().next()?.to_ascii_uppercase();
    CHOICE_LABELS.iter().position(|l| *l == c)
}
