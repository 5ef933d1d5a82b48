use crate::engine::MatchEngine;
use crate::loader::ModelAnswers;
use crate::models::{
    Answer, Judge, JudgePrompt, MatchPair, MatchSingle, PairGameRecord, Question, SingleGameRecord,
    Winner,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// The four judge variants one evaluation mode needs: default and
/// reference-based, each in single-turn and multi-turn form.
#[derive(Debug)]
pub struct JudgeBank {
    pub default: Arc<Judge>,
    pub math: Arc<Judge>,
    pub default_mt: Arc<Judge>,
    pub math_mt: Arc<Judge>,
}

impl JudgeBank {
    pub fn all(&self) -> Vec<Arc<Judge>> {
        vec![
            self.default.clone(),
            self.math.clone(),
            self.default_mt.clone(),
            self.math_mt.clone(),
        ]
    }

    fn for_question(&self, question: &Question, multi_turn: bool) -> Arc<Judge> {
        match (question.needs_ref(), multi_turn) {
            (false, false) => self.default.clone(),
            (true, false) => self.math.clone(),
            (false, true) => self.default_mt.clone(),
            (true, true) => self.math_mt.clone(),
        }
    }
}

fn template(
    prompts: &HashMap<String, Arc<JudgePrompt>>,
    name: &str,
) -> Result<Arc<JudgePrompt>> {
    prompts
        .get(name)
        .cloned()
        .with_context(|| format!("Judge prompt file has no template named {}", name))
}

/// Build the judge bank for single-answer grading.
pub fn make_judges_single(
    judge_model: &str,
    prompts: &HashMap<String, Arc<JudgePrompt>>,
) -> Result<JudgeBank> {
    Ok(JudgeBank {
        default: Arc::new(Judge::new(judge_model, template(prompts, "single-v1")?)),
        math: Arc::new(Judge::new(judge_model, template(prompts, "single-math-v1")?).ref_based()),
        default_mt: Arc::new(
            Judge::new(judge_model, template(prompts, "single-v1-multi-turn")?).multi_turn(),
        ),
        math_mt: Arc::new(
            Judge::new(judge_model, template(prompts, "single-math-v1-multi-turn")?)
                .ref_based()
                .multi_turn(),
        ),
    })
}

/// Build the judge bank for pairwise comparison.
pub fn make_judges_pairwise(
    judge_model: &str,
    prompts: &HashMap<String, Arc<JudgePrompt>>,
) -> Result<JudgeBank> {
    Ok(JudgeBank {
        default: Arc::new(Judge::new(judge_model, template(prompts, "pair-v2")?)),
        math: Arc::new(Judge::new(judge_model, template(prompts, "pair-math-v1")?).ref_based()),
        default_mt: Arc::new(
            Judge::new(judge_model, template(prompts, "pair-v2-multi-turn")?).multi_turn(),
        ),
        math_mt: Arc::new(
            Judge::new(judge_model, template(prompts, "pair-math-v1-multi-turn")?)
                .ref_based()
                .multi_turn(),
        ),
    })
}

/// One match queued for execution.
pub enum ScheduledMatch {
    Single(MatchSingle),
    Pair(MatchPair),
}

impl ScheduledMatch {
    fn category(&self) -> &str {
        match self {
            ScheduledMatch::Single(m) => &m.question.category,
            ScheduledMatch::Pair(m) => &m.question.category,
        }
    }
}

fn ref_answer_for(
    question: &Question,
    judge: &Judge,
    ref_answers: &ModelAnswers,
) -> Option<Arc<Answer>> {
    if !question.needs_ref() {
        return None;
    }
    ref_answers
        .get(&judge.model_name)
        .and_then(|answers| answers.get(&question.question_id))
        .cloned()
}

/// Schedule single-answer grading matches: one per question, model, and
/// available turn.
pub fn make_single_matches(
    questions: &[Arc<Question>],
    models: &[String],
    model_answers: &ModelAnswers,
    ref_answers: &ModelAnswers,
    bank: &JudgeBank,
) -> Result<Vec<ScheduledMatch>> {
    let mut matches = Vec::new();
    for question in questions {
        for model in models {
            let answer = answer_for(model_answers, model, question)?;
            for multi_turn in turn_modes(question) {
                let judge = bank.for_question(question, multi_turn);
                let ref_answer = ref_answer_for(question, &judge, ref_answers);
                matches.push(ScheduledMatch::Single(MatchSingle {
                    question: question.clone(),
                    model: model.clone(),
                    answer: answer.clone(),
                    judge,
                    ref_answer,
                    multi_turn,
                }));
            }
        }
    }
    Ok(matches)
}

/// Schedule pairwise matches: one per question, unordered model pair, and
/// available turn.
pub fn make_pair_matches(
    questions: &[Arc<Question>],
    models: &[String],
    model_answers: &ModelAnswers,
    ref_answers: &ModelAnswers,
    bank: &JudgeBank,
) -> Result<Vec<ScheduledMatch>> {
    let mut matches = Vec::new();
    for question in questions {
        for i in 0..models.len() {
            for j in (i + 1)..models.len() {
                let model_1 = &models[i];
                let model_2 = &models[j];
                let answer_1 = answer_for(model_answers, model_1, question)?;
                let answer_2 = answer_for(model_answers, model_2, question)?;
                for multi_turn in turn_modes(question) {
                    let judge = bank.for_question(question, multi_turn);
                    let ref_answer = ref_answer_for(question, &judge, ref_answers);
                    matches.push(ScheduledMatch::Pair(MatchPair {
                        question: question.clone(),
                        model_1: model_1.clone(),
                        model_2: model_2.clone(),
                        answer_1: answer_1.clone(),
                        answer_2: answer_2.clone(),
                        judge,
                        ref_answer,
                        multi_turn,
                    }));
                }
            }
        }
    }
    Ok(matches)
}

fn answer_for(
    model_answers: &ModelAnswers,
    model: &str,
    question: &Question,
) -> Result<Arc<Answer>> {
    model_answers
        .get(model)
        .and_then(|answers| answers.get(&question.question_id))
        .cloned()
        .with_context(|| {
            format!(
                "Missing model {}'s answer to question {}",
                model, question.question_id
            )
        })
}

fn turn_modes(question: &Question) -> Vec<bool> {
    if question.turns.len() > 1 {
        vec![false, true]
    } else {
        vec![false]
    }
}

struct MatchStats {
    category: String,
    parse_miss: bool,
    inconsistent: bool,
}

impl MatchStats {
    fn from_single(category: &str, record: &SingleGameRecord) -> Self {
        Self {
            category: category.to_string(),
            parse_miss: record.score < 0.0,
            inconsistent: false,
        }
    }

    fn from_pair(category: &str, record: &PairGameRecord) -> Self {
        Self {
            category: category.to_string(),
            parse_miss: record.g1_winner == Winner::Error || record.g2_winner == Winner::Error,
            inconsistent: record.g1_winner != record.g2_winner,
        }
    }
}

/// Per-batch tallies. Parse misses and order-swap inconsistencies are data,
/// reported separately from anything fatal.
#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub completed: usize,
    pub interrupted: bool,
    pub parse_misses: BTreeMap<String, usize>,
    pub inconsistencies: BTreeMap<String, usize>,
}

impl BatchSummary {
    fn record(&mut self, stats: &MatchStats) {
        self.completed += 1;
        if stats.parse_miss {
            *self.parse_misses.entry(stats.category.clone()).or_default() += 1;
        }
        if stats.inconsistent {
            *self
                .inconsistencies
                .entry(stats.category.clone())
                .or_default() += 1;
        }
    }
}

/// Dispatches scheduled matches over a bounded worker pool and appends
/// results to the output log through a single writer task.
pub struct BatchRunner {
    engine: Arc<MatchEngine>,
    parallel: usize,
}

impl BatchRunner {
    pub fn new(engine: Arc<MatchEngine>, parallel: usize) -> Self {
        Self {
            engine,
            parallel: parallel.max(1),
        }
    }

    /// Run all matches. Any configuration error aborts the batch; Ctrl-C
    /// stops dispatch early. Either way the log is left whole-line clean.
    pub async fn run(
        &self,
        matches: Vec<ScheduledMatch>,
        output_file: &Path,
    ) -> Result<BatchSummary> {
        info!(
            total = matches.len(),
            parallel = self.parallel,
            output = %output_file.display(),
            "starting match batch"
        );

        if let Some(parent) = output_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory: {}", parent.display())
                })?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output_file)
            .with_context(|| format!("Failed to open output file: {}", output_file.display()))?;

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                writeln!(file, "{}", line).context("Failed to append result line")?;
                file.flush().context("Failed to flush result log")?;
            }
            Ok::<(), anyhow::Error>(())
        });

        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let mut join_set: JoinSet<Result<MatchStats>> = JoinSet::new();
        for scheduled in matches {
            let engine = self.engine.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("worker pool closed")?;
                let (line, stats) = match &scheduled {
                    ScheduledMatch::Single(m) => {
                        let record = engine.play_single(m).await?;
                        (
                            serde_json::to_string(&record)?,
                            MatchStats::from_single(scheduled.category(), &record),
                        )
                    }
                    ScheduledMatch::Pair(m) => {
                        let record = engine.play_pair(m).await?;
                        (
                            serde_json::to_string(&record)?,
                            MatchStats::from_pair(scheduled.category(), &record),
                        )
                    }
                };
                tx.send(line).await.context("result writer closed")?;
                Ok(stats)
            });
        }
        drop(tx);

        let mut summary = BatchSummary::default();
        let mut interrupted = false;
        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok(Ok(stats))) => summary.record(&stats),
                    Some(Ok(Err(e))) => {
                        // Configuration error: fatal, stop the batch.
                        join_set.abort_all();
                        return Err(e);
                    }
                    Some(Err(join_err)) if join_err.is_cancelled() => {}
                    Some(Err(join_err)) => {
                        join_set.abort_all();
                        return Err(anyhow::anyhow!("match task panicked: {}", join_err));
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    warn!("interrupt received; aborting remaining matches");
                    interrupted = true;
                    join_set.abort_all();
                }
            }
        }
        summary.interrupted = interrupted;

        writer
            .await
            .context("result writer task failed")??;

        info!(completed = summary.completed, "match batch finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ChatBackend, ChatMessage, CompletionClient};
    use crate::config::ClientConfig;
    use crate::models::{Choice, JudgeOutputFormat, JudgeType, QuestionId};
    use async_trait::async_trait;
    use std::io::BufRead;
    use tempfile::tempdir;

    struct FixedBackend {
        response: &'static str,
    }

    #[async_trait]
    impl ChatBackend for FixedBackend {
        async fn chat(
            &self,
            _model: &str,
            _system_prompt: &str,
            _messages: &[ChatMessage],
            _temperature: f64,
            _max_tokens: u32,
        ) -> anyhow::Result<String> {
            Ok(self.response.to_string())
        }
    }

    fn prompt(
        name: &str,
        judge_type: JudgeType,
        format: JudgeOutputFormat,
        template: &str,
    ) -> Arc<JudgePrompt> {
        Arc::new(JudgePrompt {
            name: name.to_string(),
            judge_type,
            system_prompt: "sys".to_string(),
            prompt_template: template.to_string(),
            output_format: format,
        })
    }

    fn single_prompts() -> HashMap<String, Arc<JudgePrompt>> {
        let single = "{question} {answer}";
        let multi = "{question_1} {answer_1} {question_2} {answer_2}";
        let mut prompts = HashMap::new();
        for (name, template) in [
            ("single-v1", single),
            ("single-math-v1", single),
            ("single-v1-multi-turn", multi),
            ("single-math-v1-multi-turn", multi),
        ] {
            prompts.insert(
                name.to_string(),
                prompt(name, JudgeType::Single, JudgeOutputFormat::Rating, template),
            );
        }
        prompts
    }

    fn pair_prompts() -> HashMap<String, Arc<JudgePrompt>> {
        let single = "{question} {answer_a} {answer_b}";
        let multi = "{question_1} {answer_a_1} {answer_b_1} {question_2} {answer_a_2} {answer_b_2}";
        let mut prompts = HashMap::new();
        for (name, template) in [
            ("pair-v2", single),
            ("pair-math-v1", single),
            ("pair-v2-multi-turn", multi),
            ("pair-math-v1-multi-turn", multi),
        ] {
            prompts.insert(
                name.to_string(),
                prompt(name, JudgeType::Pairwise, JudgeOutputFormat::Letter, template),
            );
        }
        prompts
    }

    fn questions() -> Vec<Arc<Question>> {
        vec![
            Arc::new(Question {
                question_id: QuestionId::Int(1),
                category: "writing".to_string(),
                turns: vec!["one turn".to_string()],
            }),
            Arc::new(Question {
                question_id: QuestionId::Int(2),
                category: "writing".to_string(),
                turns: vec!["turn one".to_string(), "turn two".to_string()],
            }),
        ]
    }

    fn answers_for(models: &[&str], questions: &[Arc<Question>]) -> ModelAnswers {
        let mut model_answers = ModelAnswers::new();
        for model in models {
            let mut per_model = HashMap::new();
            for question in questions {
                per_model.insert(
                    question.question_id.clone(),
                    Arc::new(Answer {
                        question_id: question.question_id.clone(),
                        choices: vec![Choice {
                            turns: vec![
                                format!("{} answer 1", model),
                                format!("{} answer 2", model),
                            ],
                        }],
                    }),
                );
            }
            model_answers.insert(model.to_string(), per_model);
        }
        model_answers
    }

    fn engine(response: &'static str) -> Arc<MatchEngine> {
        let config = ClientConfig {
            max_retries: 1,
            retry_delay_secs: 0,
            ..ClientConfig::default()
        };
        Arc::new(MatchEngine::new(CompletionClient::new(
            Arc::new(FixedBackend { response }),
            config,
        )))
    }

    #[test]
    fn test_make_judges_missing_template_is_error() {
        let mut prompts = single_prompts();
        prompts.remove("single-math-v1");
        let err = make_judges_single("gpt-4", &prompts).unwrap_err();
        assert!(err.to_string().contains("single-math-v1"));
        assert!(make_judges_pairwise("gpt-4", &prompts).is_err());
    }

    #[test]
    fn test_judge_bank_flags() {
        let bank = make_judges_single("gpt-4", &single_prompts()).unwrap();
        assert!(!bank.default.ref_based && !bank.default.multi_turn);
        assert!(bank.math.ref_based && !bank.math.multi_turn);
        assert!(!bank.default_mt.ref_based && bank.default_mt.multi_turn);
        assert!(bank.math_mt.ref_based && bank.math_mt.multi_turn);
    }

    #[test]
    fn test_make_single_matches_counts_turns() {
        let questions = questions();
        let models = vec!["alpaca".to_string(), "vicuna".to_string()];
        let model_answers = answers_for(&["alpaca", "vicuna"], &questions);
        let bank = make_judges_single("gpt-4", &single_prompts()).unwrap();

        let matches = make_single_matches(
            &questions,
            &models,
            &model_answers,
            &ModelAnswers::new(),
            &bank,
        )
        .unwrap();
        // Question 1: one turn x 2 models; question 2: two turns x 2 models.
        assert_eq!(matches.len(), 6);
    }

    #[test]
    fn test_make_pair_matches_unordered_pairs() {
        let questions = questions();
        let models = vec![
            "alpaca".to_string(),
            "llama".to_string(),
            "vicuna".to_string(),
        ];
        let model_answers = answers_for(&["alpaca", "llama", "vicuna"], &questions);
        let bank = make_judges_pairwise("gpt-4", &pair_prompts()).unwrap();

        let matches = make_pair_matches(
            &questions,
            &models,
            &model_answers,
            &ModelAnswers::new(),
            &bank,
        )
        .unwrap();
        // 3 pairs per turn mode: question 1 has 1 mode, question 2 has 2.
        assert_eq!(matches.len(), 9);
    }

    #[tokio::test]
    async fn test_batch_run_writes_records_and_counts() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("judgments").join("gpt-4_single.jsonl");

        let questions = questions();
        let models = vec!["alpaca".to_string(), "vicuna".to_string()];
        let model_answers = answers_for(&["alpaca", "vicuna"], &questions);
        let bank = make_judges_single("gpt-4", &single_prompts()).unwrap();
        let matches = make_single_matches(
            &questions,
            &models,
            &model_answers,
            &ModelAnswers::new(),
            &bank,
        )
        .unwrap();
        let total = matches.len();

        let runner = BatchRunner::new(engine("[[8]]"), 4);
        let summary = runner.run(matches, &output).await.unwrap();

        assert_eq!(summary.completed, total);
        assert!(!summary.interrupted);
        assert!(summary.parse_misses.is_empty());

        let file = std::fs::File::open(&output).unwrap();
        let lines: Vec<String> = std::io::BufReader::new(file)
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines.len(), total);
        for line in &lines {
            let record: SingleGameRecord = serde_json::from_str(line).unwrap();
            assert_eq!(record.score, 8.0);
        }
    }

    #[tokio::test]
    async fn test_batch_run_counts_parse_misses_per_category() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.jsonl");

        let questions = questions();
        let models = vec!["alpaca".to_string()];
        let model_answers = answers_for(&["alpaca"], &questions);
        let bank = make_judges_single("gpt-4", &single_prompts()).unwrap();
        let matches = make_single_matches(
            &questions,
            &models,
            &model_answers,
            &ModelAnswers::new(),
            &bank,
        )
        .unwrap();
        let total = matches.len();

        let runner = BatchRunner::new(engine("no rating here"), 2);
        let summary = runner.run(matches, &output).await.unwrap();

        assert_eq!(summary.completed, total);
        assert_eq!(summary.parse_misses.get("writing"), Some(&total));
    }

    #[tokio::test]
    async fn test_batch_run_counts_inconsistencies() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.jsonl");

        let questions = vec![questions()[0].clone()];
        let models = vec!["alpaca".to_string(), "vicuna".to_string()];
        let model_answers = answers_for(&["alpaca", "vicuna"], &questions);
        let bank = make_judges_pairwise("gpt-4", &pair_prompts()).unwrap();
        let matches = make_pair_matches(
            &questions,
            &models,
            &model_answers,
            &ModelAnswers::new(),
            &bank,
        )
        .unwrap();

        // A judge that always says [[A]] flips its verdict under order swap.
        let runner = BatchRunner::new(engine("[[A]]"), 2);
        let summary = runner.run(matches, &output).await.unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.inconsistencies.get("writing"), Some(&1));
    }

    #[tokio::test]
    async fn test_batch_run_aborts_on_configuration_error() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.jsonl");

        let questions = vec![questions()[0].clone()];
        let models = vec!["alpaca".to_string()];
        let model_answers = answers_for(&["alpaca"], &questions);
        let bank = make_judges_single("claude-1", &single_prompts()).unwrap();
        let matches = make_single_matches(
            &questions,
            &models,
            &model_answers,
            &ModelAnswers::new(),
            &bank,
        )
        .unwrap();

        let runner = BatchRunner::new(engine("[[8]]"), 2);
        let err = runner.run(matches, &output).await.unwrap_err();
        assert!(err.to_string().contains("Invalid judge model name"));
    }
}
