use crate::models::{PairKey, Question, QuestionId, SingleKey, Winner};
use crate::normalize::normalize_pair_games;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Judge identity: (judge model, template name).
pub type JudgeKey = (String, String);

/// Fixed judge identities used at resolution time.
const PAIR_DEFAULT: (&str, &str) = ("gpt-4", "pair-v2");
const PAIR_MATH: (&str, &str) = ("gpt-4", "pair-math-v1");
const PAIR_DEFAULT_MT: (&str, &str) = ("gpt-4", "pair-v2-multi-turn");
const PAIR_MATH_MT: (&str, &str) = ("gpt-4", "pair-math-v1-multi-turn");
const SINGLE_DEFAULT: (&str, &str) = ("gpt-4", "single-v1");
const SINGLE_MATH: (&str, &str) = ("gpt-4", "single-math-v1");
const SINGLE_DEFAULT_MT: (&str, &str) = ("gpt-4", "single-v1-multi-turn");
const SINGLE_MATH_MT: (&str, &str) = ("gpt-4", "single-math-v1-multi-turn");

/// Folded outcome of one persisted pairwise game.
#[derive(Debug, Clone)]
pub struct PairJudgment {
    pub winner: Winner,
    pub g1_judgment: String,
    pub g2_judgment: String,
}

/// Outcome of one persisted single-answer game.
#[derive(Debug, Clone)]
pub struct SingleJudgment {
    pub score: f64,
    pub judgment: String,
}

pub type PairwiseIndex = HashMap<JudgeKey, HashMap<PairKey, PairJudgment>>;
pub type SingleIndex = HashMap<JudgeKey, HashMap<SingleKey, SingleJudgment>>;

/// A pairwise result-log line as persisted. Either a pre-folded `winner` or
/// the per-order `g1_winner`/`g2_winner` pair must be present.
#[derive(Debug, Deserialize)]
struct RawPairLine {
    question_id: QuestionId,
    model_1: String,
    model_2: String,
    judge: JudgeKey,
    #[serde(default)]
    winner: Option<Winner>,
    #[serde(default)]
    g1_winner: Option<Winner>,
    #[serde(default)]
    g2_winner: Option<Winner>,
    g1_judgment: String,
    g2_judgment: String,
}

#[derive(Debug, Deserialize)]
struct RawSingleLine {
    question_id: QuestionId,
    model: String,
    judge: JudgeKey,
    score: f64,
    judgment: String,
}

/// Fold the two order-swapped winners into one value. Disagreement is
/// recorded as `inconsistent`, never resolved by picking a side.
pub fn fold_winners(g1_winner: Winner, g2_winner: Winner) -> Winner {
    if g1_winner == g2_winner {
        g1_winner
    } else {
        Winner::Inconsistent
    }
}

fn read_lines(path: &Path) -> Result<impl Iterator<Item = std::io::Result<String>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open judgment file: {}", path.display()))?;
    Ok(BufReader::new(file).lines())
}

/// Load a pairwise result log into an index keyed by judge identity and
/// canonical game key.
pub fn load_pairwise_judgments(path: &Path) -> Result<PairwiseIndex> {
    let mut index: HashMap<JudgeKey, HashMap<PairKey, PairJudgment>> = HashMap::new();

    for line in read_lines(path)? {
        let line = line.context("Failed to read judgment line")?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawPairLine = serde_json::from_str(&line)
            .with_context(|| format!("Malformed pairwise judgment record: {}", line))?;

        let winner = match (raw.winner, raw.g1_winner, raw.g2_winner) {
            (Some(winner), _, _) => winner,
            (None, Some(g1), Some(g2)) => fold_winners(g1, g2),
            _ => bail!("Pairwise record carries neither winner nor g1_winner/g2_winner"),
        };

        let key = PairKey {
            question_id: raw.question_id,
            model_a: raw.model_1,
            model_b: raw.model_2,
        };
        index.entry(raw.judge).or_default().insert(
            key,
            PairJudgment {
                winner,
                g1_judgment: raw.g1_judgment,
                g2_judgment: raw.g2_judgment,
            },
        );
    }

    Ok(index
        .into_iter()
        .map(|(judge, games)| (judge, normalize_pair_games(games)))
        .collect())
}

/// Load a single-answer result log into an index keyed by judge identity and
/// game key.
pub fn load_single_judgments(path: &Path) -> Result<SingleIndex> {
    let mut index: SingleIndex = HashMap::new();

    for line in read_lines(path)? {
        let line = line.context("Failed to read judgment line")?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawSingleLine = serde_json::from_str(&line)
            .with_context(|| format!("Malformed single judgment record: {}", line))?;

        let key = SingleKey {
            question_id: raw.question_id,
            model: raw.model,
        };
        index.entry(raw.judge).or_default().insert(
            key,
            SingleJudgment {
                score: raw.score,
                judgment: raw.judgment,
            },
        );
    }

    Ok(index)
}

fn judge_key(identity: (&str, &str)) -> JudgeKey {
    (identity.0.to_string(), identity.1.to_string())
}

fn lookup<'a, V>(
    index: &'a HashMap<JudgeKey, V>,
    identity: (&str, &str),
) -> Result<&'a V> {
    index.get(&judge_key(identity)).with_context(|| {
        format!(
            "No judgments for judge ({}, {}); the judge set is not fully configured",
            identity.0, identity.1
        )
    })
}

/// Select the pairwise judgment set for a question: reference-based for
/// math/reasoning/coding, reference-free otherwise; multi-turn picks the
/// multi-turn template variant. An unconfigured combination is an error.
pub fn resolve_pairwise_judgments<'a>(
    question: &Question,
    normal: &'a PairwiseIndex,
    math: &'a PairwiseIndex,
    multi_turn: bool,
) -> Result<&'a HashMap<PairKey, PairJudgment>> {
    if multi_turn {
        if question.needs_ref() {
            return lookup(math, PAIR_MATH_MT);
        }
        return lookup(normal, PAIR_DEFAULT_MT);
    }

    if question.needs_ref() {
        lookup(math, PAIR_MATH)
    } else {
        lookup(normal, PAIR_DEFAULT)
    }
}

/// Select the single-answer judgment set for a question, by the same
/// category and turn-mode routing as the pairwise resolver.
pub fn resolve_single_judgments<'a>(
    question: &Question,
    normal: &'a SingleIndex,
    math: &'a SingleIndex,
    multi_turn: bool,
) -> Result<&'a HashMap<SingleKey, SingleJudgment>> {
    if multi_turn {
        if question.needs_ref() {
            return lookup(math, SINGLE_MATH_MT);
        }
        return lookup(normal, SINGLE_DEFAULT_MT);
    }

    if question.needs_ref() {
        lookup(math, SINGLE_MATH)
    } else {
        lookup(normal, SINGLE_DEFAULT)
    }
}

/// Render the judge's reasoning for a pairwise game as markdown. Accepts the
/// key in either model order; the displayed judgments follow the order asked
/// for. Returns "N/A" when the game is absent.
pub fn pairwise_explanation(key: &PairKey, games: &HashMap<PairKey, PairJudgment>) -> String {
    let (g1_judgment, g2_judgment) = if key.is_canonical() {
        match games.get(key) {
            Some(j) => (j.g1_judgment.clone(), j.g2_judgment.clone()),
            None => return "N/A".to_string(),
        }
    } else {
        let canonical = PairKey {
            question_id: key.question_id.clone(),
            model_a: key.model_b.clone(),
            model_b: key.model_a.clone(),
        };
        match games.get(&canonical) {
            Some(j) => (j.g2_judgment.clone(), j.g1_judgment.clone()),
            None => return "N/A".to_string(),
        }
    };

    format!(
        "**Game 1**. **A**: {}, **B**: {}\n\n**Judgment**: {}\
         \n\n`--------------------------`\n\n\
         **Game 2**. **A**: {}, **B**: {}\n\n**Judgment**: {}",
        key.model_a, key.model_b, g1_judgment, key.model_b, key.model_a, g2_judgment
    )
}

/// Render the judge's reasoning for a single-answer game as markdown.
pub fn single_explanation(key: &SingleKey, games: &HashMap<SingleKey, SingleJudgment>) -> String {
    match games.get(key) {
        Some(j) => format!(
            "**Game 1**. **A**: {}, **Score**: {}\n\n**Judgment**: {}",
            key.model, j.score, j.judgment
        ),
        None => "N/A".to_string(),
    }
}
