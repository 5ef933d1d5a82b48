use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Sentinel returned by the completion client after exhausting retries.
pub const API_ERROR_OUTPUT: &str = "$ERROR$";

/// Sentinel score recorded when no rating pattern matches the judgment.
pub const PARSE_MISS_SCORE: f64 = -1.0;

/// Two scores within this delta of each other are treated as a tie.
pub const TIE_DELTA: f64 = 0.1;

/// Categories that require a reference answer for judging.
pub const NEED_REF_CATS: [&str; 3] = ["math", "reasoning", "coding"];

/// Judge models accepted by the match engine.
pub const SUPPORTED_JUDGE_MODELS: [&str; 2] = ["gpt-3.5-turbo", "gpt-4"];

/// Question identifier as it appears in question files: integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuestionId {
    Int(u64),
    Text(String),
}

impl QuestionId {
    /// Parse a command-line identifier: numeric when it looks numeric.
    pub fn parse(s: &str) -> QuestionId {
        s.parse::<u64>()
            .map(QuestionId::Int)
            .unwrap_or_else(|_| QuestionId::Text(s.to_string()))
    }
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestionId::Int(n) => write!(f, "{}", n),
            QuestionId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A benchmark question: one or two conversation turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub question_id: QuestionId,
    pub category: String,
    pub turns: Vec<String>,
}

impl Question {
    /// Whether this question's category requires a reference answer.
    pub fn needs_ref(&self) -> bool {
        NEED_REF_CATS.contains(&self.category.as_str())
    }
}

/// One candidate generation for a question (per-turn responses).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub turns: Vec<String>,
}

/// A model's answer to a question. Immutable once loaded; the owning model
/// name is the key of the answer map it was loaded into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: QuestionId,
    pub choices: Vec<Choice>,
}

impl Answer {
    /// Response text for the given turn of the first choice.
    pub fn turn(&self, idx: usize) -> Option<&str> {
        self.choices.first()?.turns.get(idx).map(|s| s.as_str())
    }
}

/// Judge type declared by a prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeType {
    Single,
    Pairwise,
}

/// Output format tag declared by a prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JudgeOutputFormat {
    #[serde(rename = "[[rating]]")]
    Rating,
    #[serde(rename = "[[A]]")]
    Letter,
    #[serde(rename = "[[rating_a,rating_b]]")]
    RatingPair,
}

impl fmt::Display for JudgeOutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            JudgeOutputFormat::Rating => "[[rating]]",
            JudgeOutputFormat::Letter => "[[A]]",
            JudgeOutputFormat::RatingPair => "[[rating_a,rating_b]]",
        };
        write!(f, "{}", tag)
    }
}

/// One judge prompt template record from the judge prompt file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgePrompt {
    pub name: String,
    #[serde(rename = "type")]
    pub judge_type: JudgeType,
    pub system_prompt: String,
    pub prompt_template: String,
    pub output_format: JudgeOutputFormat,
}

/// A judge: model plus prompt template. Many matches share one judge.
#[derive(Debug, Clone)]
pub struct Judge {
    pub model_name: String,
    pub prompt: Arc<JudgePrompt>,
    pub ref_based: bool,
    pub multi_turn: bool,
}

impl Judge {
    pub fn new(model_name: &str, prompt: Arc<JudgePrompt>) -> Self {
        Self {
            model_name: model_name.to_string(),
            prompt,
            ref_based: false,
            multi_turn: false,
        }
    }

    pub fn ref_based(mut self) -> Self {
        self.ref_based = true;
        self
    }

    pub fn multi_turn(mut self) -> Self {
        self.multi_turn = true;
        self
    }

    /// The (judge model, template name) pair recorded with every result.
    pub fn identity(&self) -> (String, String) {
        (self.model_name.clone(), self.prompt.name.clone())
    }
}

/// A scheduled single-answer grading match.
#[derive(Debug, Clone)]
pub struct MatchSingle {
    pub question: Arc<Question>,
    pub model: String,
    pub answer: Arc<Answer>,
    pub judge: Arc<Judge>,
    pub ref_answer: Option<Arc<Answer>>,
    pub multi_turn: bool,
}

/// A scheduled pairwise comparison match.
#[derive(Debug, Clone)]
pub struct MatchPair {
    pub question: Arc<Question>,
    pub model_1: String,
    pub model_2: String,
    pub answer_1: Arc<Answer>,
    pub answer_2: Arc<Answer>,
    pub judge: Arc<Judge>,
    pub ref_answer: Option<Arc<Answer>>,
    pub multi_turn: bool,
}

/// Winner of a pairwise game, expressed in terms of true model identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    #[serde(rename = "model_1")]
    Model1,
    #[serde(rename = "model_2")]
    Model2,
    #[serde(rename = "tie")]
    Tie,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "inconsistent")]
    Inconsistent,
}

impl Winner {
    /// The symmetric relabeling applied when the two models of a game key are
    /// swapped: model_1 and model_2 exchange, everything else is fixed. This
    /// is the only place the swap is defined.
    pub fn swapped(self) -> Winner {
        match self {
            Winner::Model1 => Winner::Model2,
            Winner::Model2 => Winner::Model1,
            other => other,
        }
    }

}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Winner::Model1 => "model_1",
            Winner::Model2 => "model_2",
            Winner::Tie => "tie",
            Winner::Error => "error",
            Winner::Inconsistent => "inconsistent",
        };
        write!(f, "{}", s)
    }
}

/// Identity of a persisted single-answer game.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SingleKey {
    pub question_id: QuestionId,
    pub model: String,
}

/// Identity of a persisted pairwise game. Canonical form requires
/// `model_a < model_b` lexicographically; `normalize` enforces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub question_id: QuestionId,
    pub model_a: String,
    pub model_b: String,
}

impl PairKey {
    pub fn is_canonical(&self) -> bool {
        self.model_a <= self.model_b
    }
}

/// Result of one single-answer grading, as written to the result log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleGameRecord {
    pub question_id: QuestionId,
    pub model: String,
    pub judge: (String, String),
    pub user_prompt: String,
    pub judgment: String,
    pub score: f64,
    pub turn: u32,
    pub tstamp: f64,
}

/// Result of one pairwise match (both orderings), as written to the result
/// log. `m1_score`/`m2_score` are present only for the single-grading
/// fallback path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairGameRecord {
    pub question_id: QuestionId,
    pub model_1: String,
    pub model_2: String,
    pub g1_winner: Winner,
    pub g2_winner: Winner,
    pub judge: (String, String),
    pub g1_user_prompt: String,
    pub g1_judgment: String,
    pub g2_user_prompt: String,
    pub g2_judgment: String,
    pub turn: u32,
    pub tstamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m1_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m2_score: Option<f64>,
}
