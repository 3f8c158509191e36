use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, warn};

use crate::DomainResult;
use crate::context::StoreContext;
use crate::error::DomainError;
use crate::keys::{validate_question_id, validate_survey_id, validate_user_id};
use crate::ports::kv::KvBatch;
use crate::retry::retry_on_conflict;
use crate::survey::{
    AnswerValue, OptionVariant, Question, QuestionFormat, QuestionTally, TALLY_TOTAL_MEMBER,
    decode_questions,
};

/// How much one element of a raw answer adds to its question's tally.
///
/// Multi and checkbox options weigh 1. Scale values weigh 1 when inside the
/// configured bounds. Ranked options weigh `option_count - position`, so the
/// first choice earns the most. Text answers are never scored.
pub fn score_contribution(question: &Question, element: &str, position: usize) -> DomainResult<i64> {
    match &question.format {
        QuestionFormat::Text { .. } => Err(DomainError::Validation(format!(
            "text question {} is not scored",
            question.id
        ))),
        QuestionFormat::Scale { min, max, .. } => {
            let value: i64 = element.trim().parse().map_err(|_| {
                DomainError::Validation(format!(
                    "scale answer '{element}' to {} is not a number",
                    question.id
                ))
            })?;
            if value < *min || value > *max {
                return Err(DomainError::Range {
                    value: element.to_string(),
                    min: *min,
                    max: *max,
                });
            }
            Ok(1)
        }
        QuestionFormat::MultiOption { variant, options } => match variant {
            OptionVariant::Multi | OptionVariant::Checkbox => Ok(1),
            OptionVariant::Rank => {
                let count = options.len() as i64;
                let position = position as i64;
                if position >= count {
                    return Err(DomainError::Validation(format!(
                        "rank position {position} exceeds {count} options of {}",
                        question.id
                    )));
                }
                Ok(count - position)
            }
        },
    }
}

/// Checks that a raw answer has the shape its question expects.
pub fn validate_answer(question: &Question, answer: &AnswerValue) -> DomainResult<()> {
    let invalid = |reason: &str| {
        Err(DomainError::Validation(format!(
            "answer to {}: {reason}",
            question.id
        )))
    };
    match (&question.format, answer) {
        (QuestionFormat::Text { min, max }, AnswerValue::One(text)) => {
            let length = text.chars().count() as u32;
            if length < *min || length > *max {
                return invalid(&format!("text length must be within {min}..={max}"));
            }
            Ok(())
        }
        (QuestionFormat::Scale { .. }, AnswerValue::One(value)) => {
            score_contribution(question, value, 0).map(|_| ())
        }
        (QuestionFormat::MultiOption { variant, options }, AnswerValue::Many(values)) => {
            let known: HashSet<&str> = options.iter().map(|option| option.value.as_str()).collect();
            let mut seen = HashSet::new();
            for value in values {
                if !known.contains(value.as_str()) {
                    return invalid(&format!("unknown option {value}"));
                }
                if !seen.insert(value.as_str()) {
                    return invalid(&format!("option {value} given twice"));
                }
            }
            match variant {
                OptionVariant::Multi if values.len() != 1 => invalid("pick exactly one option"),
                OptionVariant::Checkbox if values.is_empty() => invalid("pick at least one option"),
                OptionVariant::Rank if values.len() != options.len() => {
                    invalid("rank every option exactly once")
                }
                _ => Ok(()),
            }
        }
        _ => invalid("answer shape does not match the question type"),
    }
}

fn decode_answer(raw: &str) -> DomainResult<AnswerValue> {
    serde_json::from_str(raw)
        .map_err(|err| DomainError::Validation(format!("stored answer is corrupt: {err}")))
}

/// Buffers the tally changes that remove `answer` from `question`'s tally.
/// Elements that no longer score against the current definition (options
/// edited away, bounds narrowed) are skipped.
fn subtract_answer(batch: &mut KvBatch, tally_key: &str, question: &Question, answer: &AnswerValue) {
    for (position, element) in answer.elements().into_iter().enumerate() {
        match score_contribution(question, element, position) {
            Ok(score) => {
                batch.zincrby(tally_key, element, -(score as f64));
            }
            Err(err) => {
                warn!(
                    question_id = %question.id,
                    element,
                    error = %err,
                    "previous answer element no longer scores, leaving it in the tally"
                );
            }
        }
    }
    batch.zincrby(tally_key, TALLY_TOTAL_MEMBER, -1.0);
}

#[derive(Clone)]
pub struct ResponseRepository {
    ctx: StoreContext,
}

impl ResponseRepository {
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    async fn load_questions(&self, survey_id: &str) -> DomainResult<Option<Vec<Question>>> {
        let key = self.ctx.keys.survey_questions(survey_id)?;
        match self.ctx.kv.get(&key).await? {
            Some(raw) => Ok(Some(decode_questions(survey_id, &raw)?)),
            None => Ok(None),
        }
    }

    /// Fails with `NotFound` when the survey has no question list; returns
    /// `None` when the list exists but lacks `question_id`.
    pub async fn get_question(
        &self,
        survey_id: &str,
        question_id: &str,
    ) -> DomainResult<Option<Question>> {
        validate_question_id(question_id)?;
        let Some(questions) = self.load_questions(survey_id).await? else {
            return Err(DomainError::NotFound(format!(
                "questions of survey {survey_id}"
            )));
        };
        Ok(questions
            .into_iter()
            .find(|question| question.id == question_id))
    }

    /// Records a user's answer and moves the tally from their previous answer
    /// (if any) to the new one. Returns `true` when an earlier answer was
    /// replaced.
    pub async fn upsert_answer(
        &self,
        user_id: &str,
        survey_id: &str,
        question_id: &str,
        answer: &AnswerValue,
    ) -> DomainResult<bool> {
        validate_user_id(user_id)?;
        let question = self
            .get_question(survey_id, question_id)
            .await?
            .ok_or_else(|| {
                DomainError::NotFound(format!("question {question_id} of survey {survey_id}"))
            })?;
        validate_answer(&question, answer)?;

        let question = &question;
        let updated = retry_on_conflict(&self.ctx.retry, "answer_upsert", move || {
            self.try_upsert_answer(user_id, survey_id, question, answer)
        })
        .await?;
        debug!(user_id, survey_id, question_id, updated, "answer recorded");
        Ok(updated)
    }

    async fn try_upsert_answer(
        &self,
        user_id: &str,
        survey_id: &str,
        question: &Question,
        answer: &AnswerValue,
    ) -> DomainResult<bool> {
        let answer_key = self.ctx.keys.user_answer(user_id, survey_id)?;
        let roster_key = self.ctx.keys.responder_roster(survey_id)?;
        let tally_key = self.ctx.keys.question_tally(survey_id, &question.id)?;

        let mut tx = self.ctx.kv.watch(&[answer_key.clone()]).await?;
        let answered = tx.hgetall(&answer_key).await?;
        let previous = answered
            .get(&question.id)
            .map(|raw| decode_answer(raw))
            .transpose()?;

        let mut batch = KvBatch::new();
        if question.is_scored() {
            if let Some(previous) = &previous {
                subtract_answer(&mut batch, &tally_key, question, previous);
            }
            for (position, element) in answer.elements().into_iter().enumerate() {
                let score = score_contribution(question, element, position)?;
                batch.zincrby(&tally_key, element, score as f64);
            }
            batch.zincrby(&tally_key, TALLY_TOTAL_MEMBER, 1.0);
        }
        let encoded = serde_json::to_string(answer)
            .map_err(|err| DomainError::Validation(format!("failed to encode answer: {err}")))?;
        batch.hset(answer_key, question.id.clone(), encoded);
        if answered.is_empty() {
            batch.hset(roster_key, user_id, self.ctx.now_ms().to_string());
        }

        if !tx.exec(batch).await? {
            return Err(DomainError::TransactionConflict);
        }
        Ok(previous.is_some())
    }

    pub async fn get_user_response(
        &self,
        user_id: &str,
        survey_id: &str,
    ) -> DomainResult<BTreeMap<String, AnswerValue>> {
        let answer_key = self.ctx.keys.user_answer(user_id, survey_id)?;
        self.ctx
            .kv
            .hgetall(&answer_key)
            .await?
            .into_iter()
            .map(|(question_id, raw)| Ok((question_id, decode_answer(&raw)?)))
            .collect()
    }

    pub async fn get_tally(&self, survey_id: &str, question_id: &str) -> DomainResult<QuestionTally> {
        let tally_key = self.ctx.keys.question_tally(survey_id, question_id)?;
        let members = self
            .ctx
            .kv
            .zrange_by_score(&tally_key, f64::NEG_INFINITY, f64::INFINITY)
            .await?;
        let mut tally = QuestionTally::default();
        for (member, score) in members {
            let score = score.round() as i64;
            if member == TALLY_TOTAL_MEMBER {
                tally.total = score;
            } else {
                tally.responses.insert(member, score);
            }
        }
        Ok(tally)
    }

    /// Removes every answer `user_id` gave to `survey_id`, reverses their tally
    /// contributions, and drops them from the roster. Returns `false` when the
    /// user had not answered.
    pub async fn delete_user_response(&self, user_id: &str, survey_id: &str) -> DomainResult<bool> {
        validate_user_id(user_id)?;
        validate_survey_id(survey_id)?;
        let questions = self.load_questions(survey_id).await?.unwrap_or_default();
        let questions = &questions;
        let removed = retry_on_conflict(&self.ctx.retry, "response_delete", move || {
            self.try_delete_user_response(user_id, survey_id, questions)
        })
        .await?;
        if removed {
            info!(user_id, survey_id, "user response removed");
        }
        Ok(removed)
    }

    async fn try_delete_user_response(
        &self,
        user_id: &str,
        survey_id: &str,
        questions: &[Question],
    ) -> DomainResult<bool> {
        let answer_key = self.ctx.keys.user_answer(user_id, survey_id)?;
        let roster_key = self.ctx.keys.responder_roster(survey_id)?;

        let mut tx = self.ctx.kv.watch(&[answer_key.clone()]).await?;
        let answered = tx.hgetall(&answer_key).await?;

        let mut batch = KvBatch::new();
        for (question_id, raw) in &answered {
            let Some(question) = questions.iter().find(|question| &question.id == question_id)
            else {
                continue;
            };
            if !question.is_scored() {
                continue;
            }
            let previous = decode_answer(raw)?;
            let tally_key = self.ctx.keys.question_tally(survey_id, question_id)?;
            subtract_answer(&mut batch, &tally_key, question, &previous);
        }
        batch.del(vec![answer_key]);
        batch.hdel(roster_key, vec![user_id.to_string()]);

        if !tx.exec(batch).await? {
            return Err(DomainError::TransactionConflict);
        }
        Ok(!answered.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survey::{QuestionOption, ScaleKind};

    fn option_question(variant: OptionVariant, count: usize) -> Question {
        Question {
            id: "qn_aaaaaaaaaa".to_string(),
            title: "Pick".to_string(),
            description: String::new(),
            required: true,
            format: QuestionFormat::MultiOption {
                variant,
                options: (0..count)
                    .map(|index| QuestionOption {
                        label: format!("Option {index}"),
                        value: format!("op_{index:0>10}"),
                    })
                    .collect(),
            },
        }
    }

    fn scale_question(min: i64, max: i64) -> Question {
        Question {
            id: "qn_bbbbbbbbbb".to_string(),
            title: "Rate".to_string(),
            description: String::new(),
            required: false,
            format: QuestionFormat::Scale {
                kind: ScaleKind::Numeric,
                min,
                max,
                min_label: String::new(),
                mid_label: String::new(),
                max_label: String::new(),
            },
        }
    }

    fn text_question() -> Question {
        Question {
            id: "qn_cccccccccc".to_string(),
            title: "Say".to_string(),
            description: String::new(),
            required: false,
            format: QuestionFormat::Text { min: 2, max: 5 },
        }
    }

    fn many(values: &[&str]) -> AnswerValue {
        AnswerValue::Many(values.iter().map(|value| value.to_string()).collect())
    }

    #[test]
    fn rank_weights_favour_the_first_choice() {
        let question = option_question(OptionVariant::Rank, 4);
        let weights: Vec<i64> = (0..4)
            .map(|position| score_contribution(&question, "op_0000000000", position).unwrap())
            .collect();
        assert_eq!(weights, vec![4, 3, 2, 1]);
        assert!(score_contribution(&question, "op_0000000000", 4).is_err());
    }

    #[test]
    fn multi_and_checkbox_weigh_one() {
        for variant in [OptionVariant::Multi, OptionVariant::Checkbox] {
            let question = option_question(variant, 3);
            assert_eq!(score_contribution(&question, "op_0000000001", 2).unwrap(), 1);
        }
    }

    #[test]
    fn scale_outside_bounds_is_a_range_fault() {
        let question = scale_question(1, 5);
        assert_eq!(score_contribution(&question, "5", 0).unwrap(), 1);
        let err = score_contribution(&question, "6", 0).expect_err("above max");
        assert!(matches!(err, DomainError::Range { min: 1, max: 5, .. }));
        let err = score_contribution(&question, "five", 0).expect_err("not numeric");
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn text_is_never_scored() {
        let err = score_contribution(&text_question(), "hi", 0).expect_err("text");
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn answer_shapes_are_checked_per_variant() {
        let multi = option_question(OptionVariant::Multi, 3);
        assert!(validate_answer(&multi, &many(&["op_0000000000"])).is_ok());
        assert!(validate_answer(&multi, &many(&["op_0000000000", "op_0000000001"])).is_err());
        assert!(validate_answer(&multi, &many(&["op_9999999999"])).is_err());

        let checkbox = option_question(OptionVariant::Checkbox, 3);
        assert!(validate_answer(&checkbox, &many(&["op_0000000000", "op_0000000002"])).is_ok());
        assert!(validate_answer(&checkbox, &many(&[])).is_err());
        assert!(validate_answer(&checkbox, &many(&["op_0000000000", "op_0000000000"])).is_err());

        let rank = option_question(OptionVariant::Rank, 3);
        assert!(
            validate_answer(
                &rank,
                &many(&["op_0000000002", "op_0000000000", "op_0000000001"])
            )
            .is_ok()
        );
        assert!(validate_answer(&rank, &many(&["op_0000000002", "op_0000000000"])).is_err());

        let text = text_question();
        assert!(validate_answer(&text, &AnswerValue::One("hey".to_string())).is_ok());
        assert!(validate_answer(&text, &AnswerValue::One("x".to_string())).is_err());
        assert!(validate_answer(&text, &many(&["hey"])).is_err());

        let scale = scale_question(0, 3);
        assert!(validate_answer(&scale, &AnswerValue::One("0".to_string())).is_ok());
        assert!(matches!(
            validate_answer(&scale, &AnswerValue::One("4".to_string())),
            Err(DomainError::Range { .. })
        ));
    }

    #[test]
    fn subtracting_an_answer_reverses_each_element_and_the_total() {
        let question = option_question(OptionVariant::Rank, 2);
        let mut batch = KvBatch::new();
        subtract_answer(
            &mut batch,
            "tally",
            &question,
            &many(&["op_0000000001", "op_0000000000"]),
        );
        let deltas: Vec<(String, f64)> = batch
            .commands()
            .iter()
            .map(|command| match command {
                crate::ports::kv::KvCommand::ZIncrBy { member, delta, .. } => {
                    (member.clone(), *delta)
                }
                other => panic!("unexpected command {other:?}"),
            })
            .collect();
        assert_eq!(
            deltas,
            vec![
                ("op_0000000001".to_string(), -2.0),
                ("op_0000000000".to_string(), -1.0),
                (TALLY_TOTAL_MEMBER.to_string(), -1.0),
            ]
        );
    }
}
