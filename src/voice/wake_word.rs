//! Wake word matching
//!
//! Works on transcribed text rather than audio. Speech recognizers mangle
//! unusual names ("McCarthy" comes back as "mccarty", "mick carthy",
//! "macarthy"), so beyond an exact check the matcher scans the first few
//! words for a token that sounds like the distinctive word of the phrase.

use serde::{Deserialize, Serialize};

/// Exact matches must begin within this many characters of the start
pub const EXACT_WINDOW_CHARS: usize = 30;

/// Number of leading words scanned by the fuzzy pass
pub const FUZZY_WINDOW_WORDS: usize = 6;

/// Fuzzy hits in this many leading words need no supporting context
pub const UNCONDITIONAL_WORDS: usize = 3;

/// Minimum confidence for a phonetic rule to count
pub const ACCEPT_CONFIDENCE: f32 = 0.5;

/// Smallest edit distance ever tolerated for the fuzzy pass
const MIN_EDIT_THRESHOLD: usize = 4;

/// Edit-distance candidates may differ from the target by at most this many
/// characters in length
const MAX_LENGTH_GAP: usize = 2;

/// Greetings and hesitations that commonly precede the wake word
const FILLER_WORDS: &[&str] = &[
    "hey", "hay", "hi", "hello", "heya", "hiya", "ok", "okay", "oi", "yo", "um", "uh", "er",
    "erm", "ah", "oh", "so", "well", "gday", "morning", "please",
];

/// Where a phonetic pattern must appear in a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    /// Token starts with the pattern
    Prefix,
    /// Pattern appears anywhere in the token
    Substring,
}

/// A known mis-hearing of the distinctive word
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneticRule {
    /// Normalized fragment (lowercase, no punctuation)
    pub pattern: String,
    /// How the fragment must sit in the token
    pub anchor: Anchor,
    /// Confidence assigned when the rule fires
    pub confidence: f32,
}

impl PhoneticRule {
    /// Rule that fires when a token starts with `pattern`
    #[must_use]
    pub fn prefix(pattern: &str, confidence: f32) -> Self {
        Self {
            pattern: normalize_token(pattern),
            anchor: Anchor::Prefix,
            confidence,
        }
    }

    /// Rule that fires when a token contains `pattern`
    #[must_use]
    pub fn substring(pattern: &str, confidence: f32) -> Self {
        Self {
            pattern: normalize_token(pattern),
            anchor: Anchor::Substring,
            confidence,
        }
    }

    fn applies(&self, token: &str) -> bool {
        if self.pattern.is_empty() || self.confidence < ACCEPT_CONFIDENCE {
            return false;
        }
        match self.anchor {
            Anchor::Prefix => token.starts_with(&self.pattern),
            Anchor::Substring => token.contains(&self.pattern),
        }
    }
}

/// Known transcriptions of "mccarthy"
const MCCARTHY_RULES: &[(&str, Anchor, f32)] = &[
    ("mccar", Anchor::Prefix, 0.9),
    ("mckar", Anchor::Prefix, 0.8),
    ("mcar", Anchor::Prefix, 0.8),
    ("macar", Anchor::Prefix, 0.8),
    ("mcka", Anchor::Prefix, 0.6),
    ("carthy", Anchor::Substring, 0.9),
    ("karthy", Anchor::Substring, 0.8),
    ("carty", Anchor::Substring, 0.7),
    ("karty", Anchor::Substring, 0.6),
    ("cardy", Anchor::Substring, 0.6),
];

/// How a wake word was recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// The phrase itself appears near the start
    Exact,
    /// A phonetic-confusion rule fired
    Phonetic,
    /// A token was within the edit-distance threshold
    EditDistance,
    /// Nothing matched
    None,
}

/// Result of a wake-word check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WakeWordMatch {
    /// Whether the wake word was heard
    pub matched: bool,
    /// Original text after the wake word, trimmed
    pub remainder: String,
    /// How the match was made
    pub kind: MatchKind,
    /// 1.0 for exact matches, lower for fuzzy ones
    pub confidence: f32,
}

impl WakeWordMatch {
    fn rejected() -> Self {
        Self {
            matched: false,
            remainder: String::new(),
            kind: MatchKind::None,
            confidence: 0.0,
        }
    }

    fn accepted(text: &str, end: usize, kind: MatchKind, confidence: f32) -> Self {
        Self {
            matched: true,
            remainder: remainder_after(text, end),
            kind,
            confidence,
        }
    }
}

/// One word of the input with its byte span in the original text
#[derive(Debug)]
struct Token {
    norm: String,
    end: usize,
    /// Start offset in the normalized (space-joined) text
    norm_start: usize,
}

/// Fuzzy wake-word matcher for one target phrase
#[derive(Debug, Clone)]
pub struct WakeWordMatcher {
    phrase: String,
    distinctive: String,
    rules: Vec<PhoneticRule>,
}

impl WakeWordMatcher {
    /// Build a matcher for `phrase` with the built-in and derived rules
    #[must_use]
    pub fn new(phrase: &str) -> Self {
        let words: Vec<String> = tokenize(phrase).into_iter().map(|t| t.norm).collect();
        let phrase = words.join(" ");
        let distinctive = words
            .get(1)
            .or_else(|| words.first())
            .cloned()
            .unwrap_or_default();

        let mut rules = derived_rules(&distinctive);
        if distinctive == "mccarthy" {
            rules.extend(
                MCCARTHY_RULES
                    .iter()
                    .map(|&(pattern, anchor, confidence)| PhoneticRule {
                        pattern: pattern.to_string(),
                        anchor,
                        confidence,
                    }),
            );
        }

        tracing::debug!(phrase, distinctive, rules = rules.len(), "wake word matcher ready");

        Self {
            phrase,
            distinctive,
            rules,
        }
    }

    /// Add extra confusion rules
    #[must_use]
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = PhoneticRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Normalized target phrase
    #[must_use]
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// The word fuzzy matching keys on
    #[must_use]
    pub fn distinctive_word(&self) -> &str {
        &self.distinctive
    }

    /// Check `text` for the wake word
    #[must_use]
    pub fn matches(&self, text: &str) -> WakeWordMatch {
        if self.phrase.is_empty() {
            return WakeWordMatch::rejected();
        }

        let tokens = tokenize(text);
        if tokens.is_empty() {
            return WakeWordMatch::rejected();
        }

        let normalized = tokens
            .iter()
            .map(|t| t.norm.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        if let Some(last) = self.exact_end(&normalized, &tokens) {
            return WakeWordMatch::accepted(text, last.end, MatchKind::Exact, 1.0);
        }

        for (index, token) in tokens.iter().take(FUZZY_WINDOW_WORDS).enumerate() {
            let Some((kind, confidence)) = self.score(&token.norm) else {
                continue;
            };

            let supported = index < UNCONDITIONAL_WORDS
                || index
                    .checked_sub(1)
                    .and_then(|prev| tokens.get(prev))
                    .is_some_and(|prev| prev.norm.chars().count() <= 2 || is_filler(&prev.norm));

            if supported {
                tracing::debug!(token = %token.norm, index, ?kind, confidence, "fuzzy wake word match");
                return WakeWordMatch::accepted(text, token.end, kind, confidence);
            }

            tracing::trace!(token = %token.norm, index, "fuzzy hit without supporting context");
        }

        WakeWordMatch::rejected()
    }

    /// Last token of the phrase when it starts on a word boundary inside the
    /// exact window and ends on one
    fn exact_end<'a>(&self, normalized: &str, tokens: &'a [Token]) -> Option<&'a Token> {
        let start = tokens
            .iter()
            .take_while(|t| normalized[..t.norm_start].chars().count() < EXACT_WINDOW_CHARS)
            .map(|t| t.norm_start)
            .find(|&start| {
                let rest = &normalized[start..];
                rest.starts_with(&self.phrase)
                    && rest[self.phrase.len()..].chars().next().is_none_or(|c| c == ' ')
            })?;

        let phrase_end = start + self.phrase.len();
        tokens.iter().rev().find(|t| t.norm_start < phrase_end)
    }

    /// Score a single token against the distinctive word
    #[allow(clippy::cast_precision_loss)]
    fn score(&self, token: &str) -> Option<(MatchKind, f32)> {
        if token == self.distinctive {
            return Some((MatchKind::EditDistance, 1.0));
        }

        let phonetic = self
            .rules
            .iter()
            .filter(|rule| rule.applies(token))
            .map(|rule| rule.confidence)
            .fold(None, |best: Option<f32>, c| Some(best.map_or(c, |b| b.max(c))));
        if let Some(confidence) = phonetic {
            return Some((MatchKind::Phonetic, confidence));
        }

        let target_len = self.distinctive.chars().count();
        let token_len = token.chars().count();
        if token_len < 3 || token_len.abs_diff(target_len) > MAX_LENGTH_GAP || is_filler(token) {
            return None;
        }

        let distance = edit_distance(token, &self.distinctive);
        (distance < target_len && distance <= edit_threshold(target_len)).then(|| {
            let confidence = 1.0 - (distance as f32 / target_len.max(1) as f32);
            (MatchKind::EditDistance, confidence.max(0.0))
        })
    }
}

/// Match `text` against `target` with a one-off matcher
#[must_use]
pub fn matches(text: &str, target: &str) -> WakeWordMatch {
    WakeWordMatcher::new(target).matches(text)
}

/// Largest edit distance tolerated for a word of `len` characters
#[must_use]
pub fn edit_threshold(len: usize) -> usize {
    MIN_EDIT_THRESHOLD.max(len / 2)
}

/// Levenshtein distance over characters
#[must_use]
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Prefix and substring rules derived from the distinctive word itself
fn derived_rules(word: &str) -> Vec<PhoneticRule> {
    let chars: Vec<char> = word.chars().collect();
    let mut rules = Vec::new();

    if chars.len() >= 6 {
        let head: String = chars[..4].iter().collect();
        rules.push(PhoneticRule {
            pattern: head,
            anchor: Anchor::Prefix,
            confidence: 0.6,
        });
    }
    if chars.len() >= 7 {
        let tail: String = chars[chars.len() - 5..].iter().collect();
        rules.push(PhoneticRule {
            pattern: tail,
            anchor: Anchor::Substring,
            confidence: 0.6,
        });
    }

    rules
}

fn is_filler(word: &str) -> bool {
    FILLER_WORDS.contains(&word)
}

fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Split on anything that is not part of a word, keeping byte spans
fn tokenize(text: &str) -> Vec<Token> {
    let is_word_char = |c: char| c.is_alphanumeric() || c == '\'' || c == '\u{2019}';

    let mut tokens = Vec::new();
    let mut norm_offset = 0;
    let mut start = None;

    let mut push = |from: usize, to: usize, tokens: &mut Vec<Token>| {
        let norm = normalize_token(&text[from..to]);
        if norm.is_empty() {
            return;
        }
        if !tokens.is_empty() {
            norm_offset += 1;
        }
        let norm_start = norm_offset;
        norm_offset += norm.len();
        tokens.push(Token {
            norm,
            end: to,
            norm_start,
        });
    };

    for (i, c) in text.char_indices() {
        match (is_word_char(c), start) {
            (true, None) => start = Some(i),
            (false, Some(from)) => {
                push(from, i, &mut tokens);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(from) = start {
        push(from, text.len(), &mut tokens);
    }

    tokens
}

fn remainder_after(text: &str, end: usize) -> String {
    text.get(end..)
        .unwrap_or_default()
        .trim_start_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .trim_end()
        .to_string()
}
