use crate::models::PairKey;
use crate::store::PairJudgment;
use std::collections::HashMap;

/// Canonicalize one pairwise game. If the key's models are out of
/// lexicographic order, swap them, swap the two per-order judgments, and
/// relabel the winner through the symmetric model bijection. Pure and
/// idempotent: a canonical input comes back unchanged.
pub fn normalize_pair_game(key: PairKey, judgment: PairJudgment) -> (PairKey, PairJudgment) {
    if key.is_canonical() {
        return (key, judgment);
    }

    let new_key = PairKey {
        question_id: key.question_id,
        model_a: key.model_b,
        model_b: key.model_a,
    };
    let new_judgment = PairJudgment {
        winner: judgment.winner.swapped(),
        g1_judgment: judgment.g2_judgment,
        g2_judgment: judgment.g1_judgment,
    };
    (new_key, new_judgment)
}

/// Canonicalize every game key in a judgment map.
pub fn normalize_pair_games(
    games: HashMap<PairKey, PairJudgment>,
) -> HashMap<PairKey, PairJudgment> {
    games
        .into_iter()
        .map(|(key, judgment)| normalize_pair_game(key, judgment))
        .collect()
}
