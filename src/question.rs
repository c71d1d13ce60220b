//! Structured question parsing from pane text.
//!
//! Agents surface multiple-choice prompts in the pane as:
//!
//! ```text
//! ☐ Pick one
//!
//! Which file?
//!
//! ❯ 1. src/a.py
//!      the first file
//!   2. src/b.py
//! ```
//!
//! The block is recognized after stripping ANSI escape sequences. A label
//! starting with `type` (or the `other` variants) marks a free-text option.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionOption {
    pub number: String,
    pub label: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub free_text: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub header: String,
    pub question: String,
    pub options: Vec<QuestionOption>,
    #[serde(skip)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Question {
    /// Two questions are the same prompt if header, text, and option labels
    /// match; timestamps are ignored.
    pub fn same_prompt(&self, other: &Question) -> bool {
        self.header == other.header
            && self.question == other.question
            && self.options == other.options
    }
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").unwrap())
}

fn option_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:❯\s*)?(\d+)\.\s+(.+?)\s*$").unwrap())
}

/// Remove ANSI escape sequences (CSI and OSC) from pane text.
pub fn strip_ansi(text: &str) -> String {
    ansi_re().replace_all(text, "").into_owned()
}

fn is_free_text_label(label: &str) -> bool {
    let lower = label.trim().to_lowercase();
    lower.starts_with("type") || lower == "other" || lower == "other..." || lower == "other…"
}

/// Parse the last complete question block out of pane text.
///
/// Returns `None` when no complete block (header, question ending in `?`,
/// at least one numbered option) is present.
pub fn parse_question(pane_text: &str) -> Option<Question> {
    let clean = strip_ansi(pane_text);
    let lines: Vec<&str> = clean.lines().collect();

    let mut found = None;
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim_start();
        if let Some(header) = line.strip_prefix("☐ ") {
            if let Some((question, rest)) = parse_block(&lines[i + 1..], header.trim()) {
                found = Some(question);
                i += 1 + rest;
                continue;
            }
        }
        i += 1;
    }
    found
}

/// Parse the body following a `☐ header` line. Returns the question and the
/// number of lines consumed.
fn parse_block(lines: &[&str], header: &str) -> Option<(Question, usize)> {
    let mut idx = 0;

    // Skip blank lines before the question text.
    while idx < lines.len() && lines[idx].trim().is_empty() {
        idx += 1;
    }

    // Question text runs until a blank line and must end in '?'.
    let mut question_lines = Vec::new();
    while idx < lines.len() && !lines[idx].trim().is_empty() {
        question_lines.push(lines[idx].trim());
        idx += 1;
    }
    let question = question_lines.join(" ");
    if question.is_empty() || !question.ends_with('?') {
        return None;
    }

    while idx < lines.len() && lines[idx].trim().is_empty() {
        idx += 1;
    }

    // Numbered options, each optionally followed by indented description lines.
    let mut options: Vec<QuestionOption> = Vec::new();
    while idx < lines.len() {
        let line = lines[idx];
        if let Some(caps) = option_re().captures(line) {
            let label = caps[2].to_string();
            options.push(QuestionOption {
                number: caps[1].to_string(),
                free_text: is_free_text_label(&label),
                label,
                description: String::new(),
            });
            idx += 1;
        } else if !options.is_empty()
            && line.len() > line.trim_start().len()
            && line.len() - line.trim_start().len() >= 3
            && !line.trim().is_empty()
        {
            // Continuation: indented ≥3 spaces under the previous option.
            let opt = options.last_mut().unwrap();
            if opt.description.is_empty() {
                opt.description = line.trim().to_string();
            } else {
                opt.description.push(' ');
                opt.description.push_str(line.trim());
            }
            idx += 1;
        } else {
            break;
        }
    }

    if options.is_empty() {
        return None;
    }

    Some((
        Question {
            header: header.to_string(),
            question,
            options,
            created_at: Some(Utc::now()),
        },
        idx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_and_osc() {
        let raw = "\x1b[31mred\x1b[0m and \x1b]0;title\x07plain";
        assert_eq!(strip_ansi(raw), "red and plain");
    }

    #[test]
    fn parses_two_option_block() {
        let pane = "☐ Pick one\n\nWhich file?\n\n❯ 1. src/a.py\n   the first file\n❯ 2. src/b.py\n";
        let q = parse_question(pane).unwrap();
        assert_eq!(q.header, "Pick one");
        assert_eq!(q.question, "Which file?");
        assert_eq!(q.options.len(), 2);
        assert_eq!(q.options[0].number, "1");
        assert_eq!(q.options[0].label, "src/a.py");
        assert_eq!(q.options[0].description, "the first file");
        assert_eq!(q.options[1].label, "src/b.py");
        assert_eq!(q.options[1].description, "");
    }

    #[test]
    fn parses_through_ansi_noise() {
        let pane = "\x1b[2m☐ Pick one\x1b[0m\n\nWhich?\n\n\x1b[36m❯ 1. yes\x1b[0m\n  2. no\n";
        let q = parse_question(pane).unwrap();
        assert_eq!(q.options.len(), 2);
        assert_eq!(q.options[1].label, "no");
    }

    #[test]
    fn free_text_variants() {
        for label in ["type something", "Type your own", "other", "Other..."] {
            assert!(is_free_text_label(label), "{label}");
        }
        assert!(!is_free_text_label("typical case"));
    }

    #[test]
    fn question_must_end_in_question_mark() {
        let pane = "☐ Header\n\nNot a question\n\n1. yes\n";
        assert!(parse_question(pane).is_none());
    }

    #[test]
    fn takes_last_complete_block() {
        let pane = "☐ Old\n\nFirst?\n\n1. a\n\nnoise\n\n☐ New\n\nSecond?\n\n1. b\n2. c\n";
        let q = parse_question(pane).unwrap();
        assert_eq!(q.header, "New");
        assert_eq!(q.options.len(), 2);
    }

    #[test]
    fn incomplete_block_is_ignored() {
        assert!(parse_question("☐ Header\n\nQuestion?\n").is_none());
        assert!(parse_question("plain output, no block").is_none());
    }

    #[test]
    fn same_prompt_ignores_timestamps() {
        let pane = "☐ H\n\nQ?\n\n1. a\n";
        let a = parse_question(pane).unwrap();
        let b = parse_question(pane).unwrap();
        assert!(a.same_prompt(&b));
    }
}
