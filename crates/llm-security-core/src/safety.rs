//! Content safety scoring for prompt injection and jailbreak attempts.
//!
//! Stateless: every call normalises the text (NFKC), runs the weighted
//! pattern catalogue and the structural heuristics, and combines the
//! triggered weights as `1 - prod(1 - w)`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// A weighted adversarial pattern.
pub struct SafetyRule {
    pub id: &'static str,
    pub weight: f64,
    pub pattern: Regex,
}

fn rule(id: &'static str, weight: f64, pattern: &str) -> SafetyRule {
    SafetyRule {
        id,
        weight,
        pattern: Regex::new(pattern).unwrap(),
    }
}

static RULES: Lazy<Vec<SafetyRule>> = Lazy::new(|| {
    vec![
        rule(
            "instruction_override",
            0.7,
            r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+(instructions|prompts|rules)",
        ),
        rule(
            "system_tag_injection",
            0.8,
            r"(?i)<\|?(system|im_start|im_end|im_sep|endoftext)\|?>",
        ),
        rule(
            "role_impersonation",
            0.35,
            r"(?i)(you\s+are\s+now|act\s+as|pretend\s+to\s+be|your\s+new\s+role\s+is)",
        ),
        rule(
            "delimiter_bypass",
            0.6,
            r"(?i)(\[INST\]|\[/INST\]|<<SYS>>|<</SYS>>)",
        ),
        rule(
            "jailbreak",
            0.85,
            r"(?i)(do\s+anything\s+now|DAN\s+mode|jailbreak|bypass\s+(safety|filter|guard))",
        ),
        rule(
            "prompt_leak",
            0.5,
            r"(?i)(show|reveal|print|output|repeat)\s+(your|the|system)\s+(prompt|instructions|rules)",
        ),
        rule(
            "encoded_payload",
            0.6,
            r"(?i)(decode|eval|execute)\s+(this\s+)?base64\s*[:=]?\s*[A-Za-z0-9+/]{20,}",
        ),
        rule(
            "context_manipulation",
            0.5,
            r"(?i)(forget|disregard|override)\s+(everything|all|what)\s+(you|i)\s+(said|told|know)",
        ),
    ]
});

const LENGTH_WEIGHT: f64 = 0.3;
const REPETITION_WEIGHT: f64 = 0.3;
const CHAR_RUN_WEIGHT: f64 = 0.2;
const SYMBOL_WEIGHT: f64 = 0.25;

/// Minimum input size before the ratio heuristics apply.
const MIN_TOKENS_FOR_REPETITION: usize = 20;
const MIN_CHARS_FOR_DENSITY: usize = 40;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// At or above this score the request proceeds but is flagged.
    pub review_threshold: f64,
    /// At or above this score the request is rejected.
    pub block_threshold: f64,
    pub max_chars: usize,
    /// Share of repeated whitespace-separated tokens considered anomalous.
    pub max_repeat_ratio: f64,
    /// Longest run of one repeated character considered normal.
    pub max_char_run: usize,
    /// Share of symbol characters among non-whitespace characters.
    pub max_symbol_density: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.4,
            block_threshold: 0.8,
            max_chars: 32_000,
            max_repeat_ratio: 0.7,
            max_char_run: 50,
            max_symbol_density: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyVerdict {
    Pass,
    Review,
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyAssessment {
    /// Bounded to `[0, 1]`.
    pub risk_score: f64,
    pub triggered_rules: Vec<String>,
    pub verdict: SafetyVerdict,
}

pub struct ContentSafetyFilter {
    config: SafetyConfig,
}

impl ContentSafetyFilter {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn assess(&self, text: &str) -> SafetyAssessment {
        let normalized: String = text.nfkc().collect();
        let mut triggered: Vec<(&str, f64)> = RULES
            .iter()
            .filter(|r| r.pattern.is_match(&normalized))
            .map(|r| (r.id, r.weight))
            .collect();

        if normalized.chars().count() > self.config.max_chars {
            triggered.push(("excessive_length", LENGTH_WEIGHT));
        }
        if repeat_ratio(&normalized) > self.config.max_repeat_ratio {
            triggered.push(("token_repetition", REPETITION_WEIGHT));
        }
        if longest_char_run(&normalized) > self.config.max_char_run {
            triggered.push(("character_run", CHAR_RUN_WEIGHT));
        }
        if symbol_density(&normalized) > self.config.max_symbol_density {
            triggered.push(("symbol_density", SYMBOL_WEIGHT));
        }

        let risk_score = combine(triggered.iter().map(|(_, w)| *w));
        SafetyAssessment {
            risk_score,
            triggered_rules: triggered.into_iter().map(|(id, _)| id.to_string()).collect(),
            verdict: self.verdict(risk_score),
        }
    }

    pub fn verdict(&self, risk_score: f64) -> SafetyVerdict {
        if risk_score >= self.config.block_threshold {
            SafetyVerdict::Block
        } else if risk_score >= self.config.review_threshold {
            SafetyVerdict::Review
        } else {
            SafetyVerdict::Pass
        }
    }
}

fn combine(weights: impl Iterator<Item = f64>) -> f64 {
    let residual: f64 = weights.map(|w| 1.0 - w.clamp(0.0, 1.0)).product();
    (1.0 - residual).clamp(0.0, 1.0)
}

fn repeat_ratio(text: &str) -> f64 {
    let tokens: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
    if tokens.len() < MIN_TOKENS_FOR_REPETITION {
        return 0.0;
    }
    let unique: std::collections::HashSet<&String> = tokens.iter().collect();
    1.0 - unique.len() as f64 / tokens.len() as f64
}

fn longest_char_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;
    for c in text.chars().filter(|c| !c.is_whitespace()) {
        if Some(c) == previous {
            current += 1;
        } else {
            current = 1;
            previous = Some(c);
        }
        longest = longest.max(current);
    }
    longest
}

fn symbol_density(text: &str) -> f64 {
    let visible: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if visible.len() < MIN_CHARS_FOR_DENSITY {
        return 0.0;
    }
    let symbols = visible.iter().filter(|c| !c.is_alphanumeric()).count();
    symbols as f64 / visible.len() as f64
}
