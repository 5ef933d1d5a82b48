use crate::models::{Answer, Judge, Question};
use anyhow::{Context, Result, bail};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("valid placeholder pattern"));

/// Fill `{name}` placeholders in a judge template from the given variables.
/// A placeholder with no matching variable is a configuration error; unused
/// variables are fine.
pub fn fill_template(template: &str, vars: &HashMap<&str, &str>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        let value = vars
            .get(name)
            .with_context(|| format!("Unknown placeholder in judge template: {{{}}}", name))?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn question_turn<'a>(question: &'a Question, idx: usize) -> Result<&'a str> {
    question
        .turns
        .get(idx)
        .map(|s| s.as_str())
        .with_context(|| {
            format!(
                "Question {} has no turn {}",
                question.question_id,
                idx + 1
            )
        })
}

fn answer_turn<'a>(answer: &'a Answer, idx: usize) -> Result<&'a str> {
    answer.turn(idx).with_context(|| {
        format!(
            "Answer to question {} has no turn {}",
            answer.question_id,
            idx + 1
        )
    })
}

/// Build (system prompt, user prompt) for a single-answer grading call.
pub fn build_single_prompt(
    question: &Question,
    answer: &Answer,
    judge: &Judge,
    ref_answer: Option<&Answer>,
    multi_turn: bool,
) -> Result<(String, String)> {
    let mut vars: HashMap<&str, &str> = HashMap::new();

    if let Some(ref_answer) = ref_answer {
        vars.insert("ref_answer_1", answer_turn(ref_answer, 0)?);
    }

    if multi_turn {
        vars.insert("question_1", question_turn(question, 0)?);
        vars.insert("question_2", question_turn(question, 1)?);
        vars.insert("answer_1", answer_turn(answer, 0)?);
        vars.insert("answer_2", answer_turn(answer, 1)?);
    } else {
        vars.insert("question", question_turn(question, 0)?);
        vars.insert("answer", answer_turn(answer, 0)?);
    }

    let user_prompt = fill_template(&judge.prompt.prompt_template, &vars)?;
    Ok((judge.prompt.system_prompt.clone(), user_prompt))
}

/// Build (system prompt, user prompt) for one ordering of a pairwise
/// comparison call. `answer_a` fills the A slot, `answer_b` the B slot.
pub fn build_pair_prompt(
    question: &Question,
    answer_a: &Answer,
    answer_b: &Answer,
    judge: &Judge,
    ref_answer: Option<&Answer>,
    multi_turn: bool,
) -> Result<(String, String)> {
    let mut vars: HashMap<&str, &str> = HashMap::new();

    if let Some(ref_answer) = ref_answer {
        vars.insert("ref_answer_1", answer_turn(ref_answer, 0)?);
        vars.insert("ref_answer_2", answer_turn(ref_answer, 1)?);
    }

    if multi_turn {
        vars.insert("question_1", question_turn(question, 0)?);
        vars.insert("question_2", question_turn(question, 1)?);
        vars.insert("answer_a_1", answer_turn(answer_a, 0)?);
        vars.insert("answer_b_1", answer_turn(answer_b, 0)?);
        vars.insert("answer_a_2", answer_turn(answer_a, 1)?);
        vars.insert("answer_b_2", answer_turn(answer_b, 1)?);
    } else {
        vars.insert("question", question_turn(question, 0)?);
        vars.insert("answer_a", answer_turn(answer_a, 0)?);
        vars.insert("answer_b", answer_turn(answer_b, 0)?);
    }

    let user_prompt = fill_template(&judge.prompt.prompt_template, &vars)?;
    Ok((judge.prompt.system_prompt.clone(), user_prompt))
}
