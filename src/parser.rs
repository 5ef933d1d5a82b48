use crate::models::PARSE_MISS_SCORE;
use regex::Regex;
use std::sync::LazyLock;

/// Raw verdict of one pairwise game, in A/B slot terms. Mapping to true model
/// identities happens in the engine, per invocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairVerdict {
    A,
    B,
    Tie,
    Error,
}

/// Rating patterns in priority order; the first match wins. The order
/// preserves the legacy precedence: bare `[[N]]` before the two
/// `[[rating: N]]` spellings.
static RATING_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"\[\[(\d+\.?\d*)\]\]").expect("valid rating pattern"),
        Regex::new(r"\[\[rating:(\d+)\]\]").expect("valid rating pattern"),
        Regex::new(r"\[\[rating: (\d+)\]\]").expect("valid rating pattern"),
    ]
});

/// Two-score patterns: double-bracket preferred, single-bracket fallback.
static TWO_SCORE_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"\[\[(\d+\.?\d*),\s?(\d+\.?\d*)\]\]").expect("valid two-score pattern"),
        Regex::new(r"\[(\d+\.?\d*),\s?(\d+\.?\d*)\]").expect("valid two-score pattern"),
    ]
});

/// Extract the numeric rating from a single-answer judgment. Returns the
/// parse-miss sentinel (-1) when no pattern matches; callers treat that as a
/// valid, low outcome rather than an error.
pub fn parse_rating(judgment: &str) -> f64 {
    for pattern in RATING_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(judgment) {
            if let Ok(rating) = caps[1].parse::<f64>() {
                return rating;
            }
        }
    }
    PARSE_MISS_SCORE
}

/// Extract the winner from a `[[A]]`-format pairwise judgment. The priority
/// is the enumeration order A, B, C, not position in the text.
pub fn parse_letter_verdict(judgment: &str) -> PairVerdict {
    if judgment.contains("[[A]]") {
        PairVerdict::A
    } else if judgment.contains("[[B]]") {
        PairVerdict::B
    } else if judgment.contains("[[C]]") {
        PairVerdict::Tie
    } else {
        PairVerdict::Error
    }
}

/// Extract the winner from a `[[rating_a,rating_b]]`-format pairwise
/// judgment by score delta.
pub fn parse_two_score_verdict(judgment: &str, tie_delta: f64) -> PairVerdict {
    for pattern in TWO_SCORE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(judgment) {
            let a = caps[1].trim().parse::<f64>();
            let b = caps[2].trim().parse::<f64>();
            if let (Ok(a), Ok(b)) = (a, b) {
                return verdict_from_scores(a, b, tie_delta);
            }
        }
    }
    PairVerdict::Error
}

/// Compare two scores under the tie band.
pub fn verdict_from_scores(a: f64, b: f64, tie_delta: f64) -> PairVerdict {
    if (a - b).abs() <= tie_delta {
        PairVerdict::Tie
    } else if a > b {
        PairVerdict::A
    } else {
        PairVerdict::B
    }
}
