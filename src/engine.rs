use crate::client::{ChatMessage, CompletionClient};
use crate::models::{
    Answer, Judge, JudgeOutputFormat, JudgeType, MatchPair, MatchSingle, PairGameRecord, Question,
    SUPPORTED_JUDGE_MODELS, SingleGameRecord, TIE_DELTA, Winner,
};
use crate::parser::{
    PairVerdict, parse_letter_verdict, parse_rating, parse_two_score_verdict, verdict_from_scores,
};
use crate::prompt::{build_pair_prompt, build_single_prompt};
use anyhow::{Result, bail};
use chrono::Utc;
use tracing::info;

/// Seconds since the epoch, sub-second precision.
fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Map a raw A/B verdict to a true model identity for one invocation order.
/// Game 1 presents answer_1 as A; game 2 presents answer_2 as A.
fn verdict_to_winner(verdict: PairVerdict, order_swapped: bool) -> Winner {
    match verdict {
        PairVerdict::A => {
            if order_swapped {
                Winner::Model2
            } else {
                Winner::Model1
            }
        }
        PairVerdict::B => {
            if order_swapped {
                Winner::Model1
            } else {
                Winner::Model2
            }
        }
        PairVerdict::Tie => Winner::Tie,
        PairVerdict::Error => Winner::Error,
    }
}

/// Runs matches against a judge model. Configuration errors surface before
/// any completion call; parse misses come back as sentinel outcomes inside
/// the record.
pub struct MatchEngine {
    client: CompletionClient,
    tie_delta: f64,
}

impl MatchEngine {
    pub fn new(client: CompletionClient) -> Self {
        Self {
            client,
            tie_delta: TIE_DELTA,
        }
    }

    fn check_judge_model(judge: &Judge) -> Result<()> {
        if !SUPPORTED_JUDGE_MODELS.contains(&judge.model_name.as_str()) {
            bail!("Invalid judge model name: {}", judge.model_name);
        }
        Ok(())
    }

    /// One single-answer grading call: build prompt, complete, parse rating.
    async fn run_judge_single(
        &self,
        question: &Question,
        answer: &Answer,
        judge: &Judge,
        ref_answer: Option<&Answer>,
        multi_turn: bool,
    ) -> Result<(f64, String, String)> {
        Self::check_judge_model(judge)?;

        if judge.prompt.output_format != JudgeOutputFormat::Rating {
            bail!("Invalid output format: {}", judge.prompt.output_format);
        }

        let (system_prompt, user_prompt) =
            build_single_prompt(question, answer, judge, ref_answer, multi_turn)?;

        let judgment = self
            .client
            .complete(
                &judge.model_name,
                &system_prompt,
                &[ChatMessage::user(user_prompt.clone())],
            )
            .await;

        let rating = parse_rating(&judgment);
        Ok((rating, user_prompt, judgment))
    }

    /// One ordering of a pairwise comparison call: `answer_a` in the A slot.
    async fn run_judge_pair(
        &self,
        question: &Question,
        answer_a: &Answer,
        answer_b: &Answer,
        judge: &Judge,
        ref_answer: Option<&Answer>,
        multi_turn: bool,
    ) -> Result<(PairVerdict, String, String)> {
        Self::check_judge_model(judge)?;

        let format = judge.prompt.output_format;
        if format == JudgeOutputFormat::Rating {
            bail!("Invalid output format: {}", format);
        }

        let (system_prompt, user_prompt) =
            build_pair_prompt(question, answer_a, answer_b, judge, ref_answer, multi_turn)?;

        let judgment = self
            .client
            .complete(
                &judge.model_name,
                &system_prompt,
                &[ChatMessage::user(user_prompt.clone())],
            )
            .await;

        let verdict = match format {
            JudgeOutputFormat::Letter => parse_letter_verdict(&judgment),
            JudgeOutputFormat::RatingPair => parse_two_score_verdict(&judgment, self.tie_delta),
            JudgeOutputFormat::Rating => unreachable!("rejected above"),
        };

        Ok((verdict, user_prompt, judgment))
    }

    /// Play one single-answer grading match.
    pub async fn play_single(&self, m: &MatchSingle) -> Result<SingleGameRecord> {
        if m.judge.prompt.judge_type != JudgeType::Single {
            bail!("invalid judge type: {:?}", m.judge.prompt.judge_type);
        }

        let (score, user_prompt, judgment) = self
            .run_judge_single(
                &m.question,
                &m.answer,
                &m.judge,
                m.ref_answer.as_deref(),
                m.multi_turn,
            )
            .await?;

        let turn = if m.multi_turn { 2 } else { 1 };
        let record = SingleGameRecord {
            question_id: m.question.question_id.clone(),
            model: m.model.clone(),
            judge: m.judge.identity(),
            user_prompt,
            judgment,
            score,
            turn,
            tstamp: unix_now(),
        };

        info!(
            question = %record.question_id,
            turn,
            model = %record.model,
            score,
            judge_model = %record.judge.0,
            judge_prompt = %record.judge.1,
            "single match done"
        );

        Ok(record)
    }

    /// Play one pairwise match. True pairwise judges run the comparison in
    /// both answer orders to cancel positional preference; single-type
    /// judges grade each answer independently and compare scores.
    pub async fn play_pair(&self, m: &MatchPair) -> Result<PairGameRecord> {
        match m.judge.prompt.judge_type {
            JudgeType::Pairwise => self.play_pair_double_order(m).await,
            JudgeType::Single => self.play_pair_by_scores(m).await,
        }
    }

    async fn play_pair_double_order(&self, m: &MatchPair) -> Result<PairGameRecord> {
        let ref_answer = m.ref_answer.as_deref();

        // The two orderings are independent; run them concurrently.
        let (g1, g2) = tokio::join!(
            self.run_judge_pair(
                &m.question,
                &m.answer_1,
                &m.answer_2,
                &m.judge,
                ref_answer,
                m.multi_turn,
            ),
            self.run_judge_pair(
                &m.question,
                &m.answer_2,
                &m.answer_1,
                &m.judge,
                ref_answer,
                m.multi_turn,
            ),
        );
        let (g1_verdict, g1_user_prompt, g1_judgment) = g1?;
        let (g2_verdict, g2_user_prompt, g2_judgment) = g2?;

        let g1_winner = verdict_to_winner(g1_verdict, false);
        let g2_winner = verdict_to_winner(g2_verdict, true);

        let turn = if m.multi_turn { 2 } else { 1 };
        let record = PairGameRecord {
            question_id: m.question.question_id.clone(),
            model_1: m.model_1.clone(),
            model_2: m.model_2.clone(),
            g1_winner,
            g2_winner,
            judge: m.judge.identity(),
            g1_user_prompt,
            g1_judgment,
            g2_user_prompt,
            g2_judgment,
            turn,
            tstamp: unix_now(),
            m1_score: None,
            m2_score: None,
        };

        info!(
            question = %record.question_id,
            turn,
            model_1 = %record.model_1,
            model_2 = %record.model_2,
            g1_winner = %record.g1_winner,
            g2_winner = %record.g2_winner,
            judge_model = %record.judge.0,
            judge_prompt = %record.judge.1,
            "pairwise match done"
        );

        Ok(record)
    }

    /// Pairwise comparison via two independent single-answer gradings.
    /// Grades the first turn only and computes the winner from one ordering
    /// of scores, with no position-swap double run. A known asymmetry in
    /// bias control relative to the double-order path.
    async fn play_pair_by_scores(&self, m: &MatchPair) -> Result<PairGameRecord> {
        let ref_answer = m.ref_answer.as_deref();

        let (r1, r2) = tokio::join!(
            self.run_judge_single(&m.question, &m.answer_1, &m.judge, ref_answer, false),
            self.run_judge_single(&m.question, &m.answer_2, &m.judge, ref_answer, false),
        );
        let (m1_score, g1_user_prompt, g1_judgment) = r1?;
        let (m2_score, g2_user_prompt, g2_judgment) = r2?;

        let winner = verdict_to_winner(
            verdict_from_scores(m1_score, m2_score, self.tie_delta),
            false,
        );

        let record = PairGameRecord {
            question_id: m.question.question_id.clone(),
            model_1: m.model_1.clone(),
            model_2: m.model_2.clone(),
            g1_winner: winner,
            g2_winner: winner,
            judge: m.judge.identity(),
            g1_user_prompt,
            g1_judgment,
            g2_user_prompt,
            g2_judgment,
            turn: 1,
            tstamp: unix_now(),
            m1_score: Some(m1_score),
            m2_score: Some(m2_score),
        };

        info!(
            question = %record.question_id,
            model_1 = %record.model_1,
            model_2 = %record.model_2,
            winner = %winner,
            m1_score,
            m2_score,
            judge_model = %record.judge.0,
            judge_prompt = %record.judge.1,
            "pairwise-by-scores match done"
        );

        Ok(record)
    }
}
