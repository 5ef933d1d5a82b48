use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod engine;
mod loader;
mod models;
mod normalize;
mod output;
mod parser;
mod prompt;
mod runner;
mod store;

use crate::client::{CompletionClient, OpenAiBackend};
use crate::config::ClientConfig;
use crate::engine::MatchEngine;
use crate::loader::ModelAnswers;
use crate::models::{PairKey, Question, QuestionId, SingleKey};
use crate::output::OutputFormat;
use crate::runner::{
    BatchRunner, make_judges_pairwise, make_judges_single, make_pair_matches, make_single_matches,
};
use crate::store::{
    PairwiseIndex, SingleIndex, load_pairwise_judgments, load_single_judgments,
    pairwise_explanation, resolve_pairwise_judgments, resolve_single_judgments,
    single_explanation,
};

/// Evaluation mode: grade each answer alone, or compare model pairs.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum EvalMode {
    Single,
    Pairwise,
}

/// Judge-model evaluation CLI - grade model answers with a judge model and
/// log structured match results
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose output - debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a batch of judge matches and append results to a log
    Judge(JudgeArgs),
    /// Render the recorded judge reasoning for one game
    Explain(ExplainArgs),
}

#[derive(clap::Args, Debug)]
struct JudgeArgs {
    /// Path to the question file (JSONL)
    #[arg(long)]
    question_file: PathBuf,

    /// Directory of per-model answer files (<model>.jsonl)
    #[arg(long)]
    answer_dir: PathBuf,

    /// Directory of reference answer files, keyed by judge model
    #[arg(long)]
    ref_answer_dir: Option<PathBuf>,

    /// Path to the judge prompt file (JSONL)
    #[arg(long)]
    judge_file: PathBuf,

    /// Judge model identifier
    #[arg(long, default_value = "gpt-4")]
    judge_model: String,

    /// Evaluation mode
    #[arg(long, value_enum, default_value = "single")]
    mode: EvalMode,

    /// Path of the result log to append to
    #[arg(long)]
    output_file: PathBuf,

    /// Models to evaluate; defaults to every model in the answer directory
    #[arg(long)]
    model_list: Option<Vec<String>>,

    /// Concurrent matches
    #[arg(long, default_value_t = 1)]
    parallel: usize,

    /// Optional TOML file with client settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Summary format: plain or json
    #[arg(short, long, value_enum, default_value = "plain")]
    output: OutputFormat,
}

#[derive(clap::Args, Debug)]
struct ExplainArgs {
    /// Path to the question file (JSONL)
    #[arg(long)]
    question_file: PathBuf,

    /// Result log of the reference-free judge
    #[arg(long)]
    judgment_file: PathBuf,

    /// Result log of the reference-based judge
    #[arg(long)]
    math_judgment_file: Option<PathBuf>,

    /// Evaluation mode the log was produced in
    #[arg(long, value_enum, default_value = "single")]
    mode: EvalMode,

    /// Question to explain
    #[arg(long)]
    question_id: String,

    /// Model (single mode) or first model (pairwise mode)
    #[arg(long)]
    model: String,

    /// Second model (pairwise mode)
    #[arg(long)]
    model_2: Option<String>,

    /// Explain the multi-turn game instead of the first turn
    #[arg(long)]
    multi_turn: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_judge(args: JudgeArgs) -> Result<()> {
    let client_config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };

    let questions = loader::load_questions(&args.question_file)?;
    let model_answers = loader::load_model_answers(&args.answer_dir)?;
    let ref_answers = match &args.ref_answer_dir {
        Some(dir) => loader::load_model_answers(dir)?,
        None => ModelAnswers::new(),
    };
    let judge_prompts = loader::load_judge_prompts(&args.judge_file)?;

    let models = match &args.model_list {
        Some(models) => models.clone(),
        None => loader::model_list_from_answer_dir(&args.answer_dir)?,
    };

    let bank = match args.mode {
        EvalMode::Single => make_judges_single(&args.judge_model, &judge_prompts)?,
        EvalMode::Pairwise => make_judges_pairwise(&args.judge_model, &judge_prompts)?,
    };

    loader::check_data(
        &questions,
        &model_answers,
        &ref_answers,
        &models,
        &bank.all(),
    )?;

    let matches = match args.mode {
        EvalMode::Single => {
            make_single_matches(&questions, &models, &model_answers, &ref_answers, &bank)?
        }
        EvalMode::Pairwise => {
            make_pair_matches(&questions, &models, &model_answers, &ref_answers, &bank)?
        }
    };

    let backend = Arc::new(OpenAiBackend::new(&client_config)?);
    let engine = Arc::new(MatchEngine::new(CompletionClient::new(
        backend,
        client_config,
    )));

    let runner = BatchRunner::new(engine, args.parallel);
    let summary = runner.run(matches, &args.output_file).await?;

    output::print_summary(&summary, args.output);

    Ok(())
}

fn find_question(questions: &[Arc<Question>], id: &QuestionId) -> Result<Arc<Question>> {
    questions
        .iter()
        .find(|q| &q.question_id == id)
        .cloned()
        .with_context(|| format!("Question {} not found in question file", id))
}

fn run_explain(args: ExplainArgs) -> Result<()> {
    let questions = loader::load_questions(&args.question_file)?;
    let question_id = QuestionId::parse(&args.question_id);
    let question = find_question(&questions, &question_id)?;

    let explanation = match args.mode {
        EvalMode::Single => {
            if args.model_2.is_some() {
                bail!("--model-2 only applies to pairwise mode");
            }
            let normal = load_single_judgments(&args.judgment_file)?;
            let math = load_optional_single(args.math_judgment_file.as_deref())?;
            let games = resolve_single_judgments(&question, &normal, &math, args.multi_turn)?;
            let key = SingleKey {
                question_id,
                model: args.model,
            };
            single_explanation(&key, games)
        }
        EvalMode::Pairwise => {
            let model_2 = args
                .model_2
                .context("--model-2 is required in pairwise mode")?;
            let normal = load_pairwise_judgments(&args.judgment_file)?;
            let math = load_optional_pairwise(args.math_judgment_file.as_deref())?;
            let games = resolve_pairwise_judgments(&question, &normal, &math, args.multi_turn)?;
            let key = PairKey {
                question_id,
                model_a: args.model,
                model_b: model_2,
            };
            pairwise_explanation(&key, games)
        }
    };

    println!("{}", explanation);
    Ok(())
}

fn load_optional_single(path: Option<&Path>) -> Result<SingleIndex> {
    match path {
        Some(path) => load_single_judgments(path),
        None => Ok(SingleIndex::new()),
    }
}

fn load_optional_pairwise(path: Option<&Path>) -> Result<PairwiseIndex> {
    match path {
        Some(path) => load_pairwise_judgments(path),
        None => Ok(PairwiseIndex::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Judge(judge_args) => run_judge(judge_args).await,
        Command::Explain(explain_args) => run_explain(explain_args),
    }
}
