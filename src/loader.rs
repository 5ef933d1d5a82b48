use crate::models::{Answer, Judge, JudgePrompt, Question, QuestionId};
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Answers keyed by question id, for one model.
pub type AnswerMap = HashMap<QuestionId, Arc<Answer>>;

/// Answers keyed by model name, then question id.
pub type ModelAnswers = HashMap<String, AnswerMap>;

fn jsonl_lines(path: &Path) -> Result<impl Iterator<Item = std::io::Result<String>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    Ok(BufReader::new(file).lines())
}

/// Load questions from a newline-delimited JSON file.
pub fn load_questions(path: &Path) -> Result<Vec<Arc<Question>>> {
    let mut questions = Vec::new();
    for line in jsonl_lines(path)? {
        let line = line.context("Failed to read question line")?;
        if line.trim().is_empty() {
            continue;
        }
        let question: Question = serde_json::from_str(&line)
            .with_context(|| format!("Malformed question record: {}", line))?;
        if question.turns.is_empty() {
            bail!("Question {} has no turns", question.question_id);
        }
        questions.push(Arc::new(question));
    }
    Ok(questions)
}

/// Load model answers from a directory of `<model>.jsonl` files. The model
/// name is the filename stem.
pub fn load_model_answers(dir: &Path) -> Result<ModelAnswers> {
    let mut model_answers = ModelAnswers::new();
    for path in answer_files(dir)? {
        debug!(file = %path.display(), "loading model answers");
        let model = file_stem(&path)?;
        let mut answers = AnswerMap::new();
        for line in jsonl_lines(&path)? {
            let line = line.context("Failed to read answer line")?;
            if line.trim().is_empty() {
                continue;
            }
            let answer: Answer = serde_json::from_str(&line)
                .with_context(|| format!("Malformed answer record in {}: {}", model, line))?;
            answers.insert(answer.question_id.clone(), Arc::new(answer));
        }
        model_answers.insert(model, answers);
    }
    Ok(model_answers)
}

/// Load judge prompt templates keyed by template name.
pub fn load_judge_prompts(path: &Path) -> Result<HashMap<String, Arc<JudgePrompt>>> {
    let mut prompts = HashMap::new();
    for line in jsonl_lines(path)? {
        let line = line.context("Failed to read judge prompt line")?;
        if line.trim().is_empty() {
            continue;
        }
        let prompt: JudgePrompt = serde_json::from_str(&line)
            .with_context(|| format!("Malformed judge prompt record: {}", line))?;
        prompts.insert(prompt.name.clone(), Arc::new(prompt));
    }
    Ok(prompts)
}

/// Model names present in an answer directory (filename stems), sorted.
pub fn model_list_from_answer_dir(dir: &Path) -> Result<Vec<String>> {
    let mut models = Vec::new();
    for path in answer_files(dir)? {
        models.push(file_stem(&path)?);
    }
    models.sort();
    Ok(models)
}

fn answer_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read answer directory: {}", dir.display()))?;
    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect();
    paths.sort();
    Ok(paths)
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .with_context(|| format!("Answer file has no usable name: {}", path.display()))
}

/// Validate the loaded data against the configured models and judges before
/// any match runs: every model must have answered every question, and
/// reference answers must exist for reference-based judges on categories
/// that require them.
pub fn check_data(
    questions: &[Arc<Question>],
    model_answers: &ModelAnswers,
    ref_answers: &ModelAnswers,
    models: &[String],
    judges: &[Arc<Judge>],
) -> Result<()> {
    for model in models {
        let answers = model_answers
            .get(model)
            .with_context(|| format!("Missing model answer file for {}", model))?;
        for question in questions {
            if !answers.contains_key(&question.question_id) {
                bail!(
                    "Missing model {}'s answer to question {}",
                    model,
                    question.question_id
                );
            }
        }
    }

    for judge in judges {
        if !judge.ref_based {
            continue;
        }
        for question in questions {
            if !question.needs_ref() {
                continue;
            }
            let found = ref_answers
                .get(&judge.model_name)
                .map(|answers| answers.contains_key(&question.question_id))
                .unwrap_or(false);
            if !found {
                bail!(
                    "Missing reference answer to question {} for judge {}",
                    question.question_id,
                    judge.model_name
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JudgeOutputFormat, JudgeType};
    use std::io::Write;
    use tempfile::{NamedTempFile, tempdir};

    fn write_jsonl(path: &Path, lines: &[&str]) {
        let mut file = File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    #[test]
    fn test_load_questions() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"question_id": 81, "category": "writing", "turns": ["Compose a post.", "Rewrite it."]}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"question_id": "q-math", "category": "math", "turns": ["Solve x."]}}"#
        )
        .unwrap();

        let questions = load_questions(file.path()).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].question_id, QuestionId::Int(81));
        assert_eq!(questions[0].turns.len(), 2);
        assert!(questions[1].needs_ref());
    }

    #[test]
    fn test_load_questions_rejects_empty_turns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"question_id": 1, "category": "writing", "turns": []}}"#
        )
        .unwrap();
        assert!(load_questions(file.path()).is_err());
    }

    #[test]
    fn test_load_model_answers_keyed_by_filename() {
        let dir = tempdir().unwrap();
        write_jsonl(
            &dir.path().join("alpaca.jsonl"),
            &[r#"{"question_id": 81, "choices": [{"turns": ["my answer"]}]}"#],
        );
        write_jsonl(
            &dir.path().join("vicuna.jsonl"),
            &[r#"{"question_id": 81, "choices": [{"turns": ["other answer"]}]}"#],
        );
        // Non-jsonl files are ignored.
        write_jsonl(&dir.path().join("notes.txt"), &["ignore me"]);

        let answers = load_model_answers(dir.path()).unwrap();
        assert_eq!(answers.len(), 2);
        let alpaca = answers.get("alpaca").unwrap();
        assert_eq!(
            alpaca.get(&QuestionId::Int(81)).unwrap().turn(0),
            Some("my answer")
        );
    }

    #[test]
    fn test_model_list_sorted() {
        let dir = tempdir().unwrap();
        write_jsonl(&dir.path().join("vicuna.jsonl"), &[]);
        write_jsonl(&dir.path().join("alpaca.jsonl"), &[]);
        let models = model_list_from_answer_dir(dir.path()).unwrap();
        assert_eq!(models, vec!["alpaca".to_string(), "vicuna".to_string()]);
    }

    #[test]
    fn test_load_judge_prompts() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"name": "single-v1", "type": "single", "system_prompt": "sys", "prompt_template": "{{question}} {{answer}}", "output_format": "[[rating]]"}}"#
        )
        .unwrap();
        let prompts = load_judge_prompts(file.path()).unwrap();
        let prompt = prompts.get("single-v1").unwrap();
        assert_eq!(prompt.judge_type, JudgeType::Single);
        assert_eq!(prompt.output_format, JudgeOutputFormat::Rating);
    }

    fn sample_data() -> (Vec<Arc<Question>>, ModelAnswers, ModelAnswers) {
        let questions = vec![
            Arc::new(Question {
                question_id: QuestionId::Int(1),
                category: "coding".to_string(),
                turns: vec!["q".to_string()],
            }),
            Arc::new(Question {
                question_id: QuestionId::Int(2),
                category: "writing".to_string(),
                turns: vec!["q".to_string()],
            }),
        ];
        let answer = Arc::new(Answer {
            question_id: QuestionId::Int(1),
            choices: vec![crate::models::Choice {
                turns: vec!["a".to_string()],
            }],
        });
        let answer2 = Arc::new(Answer {
            question_id: QuestionId::Int(2),
            choices: vec![crate::models::Choice {
                turns: vec!["a".to_string()],
            }],
        });
        let mut per_model = AnswerMap::new();
        per_model.insert(QuestionId::Int(1), answer.clone());
        per_model.insert(QuestionId::Int(2), answer2);
        let mut model_answers = ModelAnswers::new();
        model_answers.insert("alpaca".to_string(), per_model);

        let mut ref_map = AnswerMap::new();
        ref_map.insert(QuestionId::Int(1), answer);
        let mut ref_answers = ModelAnswers::new();
        ref_answers.insert("gpt-4".to_string(), ref_map);

        (questions, model_answers, ref_answers)
    }

    fn ref_judge() -> Arc<Judge> {
        Arc::new(
            Judge::new(
                "gpt-4",
                Arc::new(JudgePrompt {
                    name: "single-math-v1".to_string(),
                    judge_type: JudgeType::Single,
                    system_prompt: String::new(),
                    prompt_template: String::new(),
                    output_format: JudgeOutputFormat::Rating,
                }),
            )
            .ref_based(),
        )
    }

    #[test]
    fn test_check_data_ok() {
        let (questions, model_answers, ref_answers) = sample_data();
        let models = vec!["alpaca".to_string()];
        let judges = vec![ref_judge()];
        assert!(check_data(&questions, &model_answers, &ref_answers, &models, &judges).is_ok());
    }

    #[test]
    fn test_check_data_missing_model_answer() {
        let (questions, model_answers, ref_answers) = sample_data();
        let models = vec!["alpaca".to_string(), "vicuna".to_string()];
        let err = check_data(&questions, &model_answers, &ref_answers, &models, &[])
            .unwrap_err();
        assert!(err.to_string().contains("vicuna"));
    }

    #[test]
    fn test_check_data_missing_reference_answer() {
        let (questions, model_answers, _) = sample_data();
        let models = vec!["alpaca".to_string()];
        let judges = vec![ref_judge()];
        let err = check_data(
            &questions,
            &model_answers,
            &ModelAnswers::new(),
            &models,
            &judges,
        )
        .unwrap_err();
        assert!(err.to_string().contains("reference answer"));
    }
}
