use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::DomainResult;
use crate::error::DomainError;
use crate::keys::{validate_option_id, validate_question_id, validate_survey_id, validate_user_id};

pub const MAX_QUESTIONS: usize = 50;
pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 20;
pub const SCALE_FLOOR: i64 = 0;
pub const SCALE_CEILING: i64 = 10;
pub const TEXT_CEILING: u32 = 10_000;
const MAX_LABEL_LENGTH: usize = 200;
/// Latest accepted publish or close date, 9999-12-31T23:59:59.999Z.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// Reserved tally member counting answering users. Never a valid option or
/// scale value.
pub const TALLY_TOTAL_MEMBER: &str = "total";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SurveyConfig {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub intro: String,
    pub outro: String,
    pub allow_multiple: bool,
    pub create_date: i64,
    pub publish_date: Option<i64>,
    pub close_date: Option<i64>,
    /// Filled from the responder roster on read.
    #[serde(default)]
    pub response_count: u64,
    #[serde(default)]
    pub delete_queued: bool,
}

impl SurveyConfig {
    pub fn is_published(&self, now_ms: i64) -> bool {
        self.publish_date.is_some_and(|date| date <= now_ms)
    }

    pub fn is_closed(&self, now_ms: i64) -> bool {
        self.close_date.is_some_and(|date| date <= now_ms)
    }

    /// Answer upserts must only be issued while this holds.
    pub fn accepts_responses(&self, now_ms: i64) -> bool {
        !self.delete_queued && self.is_published(now_ms) && !self.is_closed(now_ms)
    }

    pub(crate) fn decode(survey_id: &str, raw: &str) -> DomainResult<Self> {
        let config: SurveyConfig = serde_json::from_str(raw).map_err(|err| {
            DomainError::Validation(format!("stored config of {survey_id} is corrupt: {err}"))
        })?;
        if config.id != survey_id {
            return Err(DomainError::Validation(format!(
                "stored config of {survey_id} carries id {}",
                config.id
            )));
        }
        validate_user_id(&config.owner).map_err(|err| {
            DomainError::Validation(format!("stored config of {survey_id} is corrupt: {err}"))
        })?;
        if config.title.trim().is_empty() {
            return Err(DomainError::Validation(format!(
                "stored config of {survey_id} has an empty title"
            )));
        }
        Ok(config)
    }

    pub(crate) fn encode(&self) -> DomainResult<String> {
        serde_json::to_string(self)
            .map_err(|err| DomainError::Validation(format!("failed to encode config: {err}")))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SurveyWithQuestions {
    #[serde(flatten)]
    pub config: SurveyConfig,
    pub questions: Vec<Question>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScaleKind {
    Numeric,
    Stars,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptionVariant {
    /// Pick exactly one.
    Multi,
    /// Pick one or more.
    Checkbox,
    /// Order every option.
    Rank,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionOption {
    pub label: String,
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum QuestionFormat {
    Text {
        min: u32,
        max: u32,
    },
    Scale {
        kind: ScaleKind,
        min: i64,
        max: i64,
        #[serde(default)]
        min_label: String,
        #[serde(default)]
        mid_label: String,
        #[serde(default)]
        max_label: String,
    },
    MultiOption {
        variant: OptionVariant,
        options: Vec<QuestionOption>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct Question {
    pub id: String,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[serde(default)]
    #[validate(length(max = 1000))]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub format: QuestionFormat,
}

impl Question {
    /// Text answers are stored but never tallied.
    pub fn is_scored(&self) -> bool {
        !matches!(self.format, QuestionFormat::Text { .. })
    }

    pub fn option_values(&self) -> Vec<&str> {
        match &self.format {
            QuestionFormat::MultiOption { options, .. } => {
                options.iter().map(|option| option.value.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn check(&self) -> DomainResult<()> {
        validate_question_id(&self.id)?;
        self.validate()
            .map_err(|err| DomainError::Validation(format!("question {}: {err}", self.id)))?;
        match &self.format {
            QuestionFormat::Text { min, max } => {
                if min > max || *max > TEXT_CEILING {
                    return Err(DomainError::Validation(format!(
                        "question {}: text bounds must satisfy min <= max <= {TEXT_CEILING}",
                        self.id
                    )));
                }
            }
            QuestionFormat::Scale {
                min,
                max,
                min_label,
                mid_label,
                max_label,
                ..
            } => {
                if *min < SCALE_FLOOR || min >= max || *max > SCALE_CEILING {
                    return Err(DomainError::Validation(format!(
                        "question {}: scale bounds must satisfy {SCALE_FLOOR} <= min < max <= {SCALE_CEILING}",
                        self.id
                    )));
                }
                for label in [min_label, mid_label, max_label] {
                    if label.chars().count() > MAX_LABEL_LENGTH {
                        return Err(DomainError::Validation(format!(
                            "question {}: scale label exceeds {MAX_LABEL_LENGTH} characters",
                            self.id
                        )));
                    }
                }
            }
            QuestionFormat::MultiOption { options, .. } => {
                if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&options.len()) {
                    return Err(DomainError::Validation(format!(
                        "question {}: expected {MIN_OPTIONS}..={MAX_OPTIONS} options, got {}",
                        self.id,
                        options.len()
                    )));
                }
                let mut seen = HashSet::new();
                for option in options {
                    validate_option_id(&option.value)?;
                    if !seen.insert(option.value.as_str()) {
                        return Err(DomainError::Validation(format!(
                            "question {}: duplicate option {}",
                            self.id, option.value
                        )));
                    }
                    let label_len = option.label.trim().chars().count();
                    if label_len == 0 || label_len > MAX_LABEL_LENGTH {
                        return Err(DomainError::Validation(format!(
                            "question {}: option label must be 1..={MAX_LABEL_LENGTH} characters",
                            self.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn decode_questions(survey_id: &str, raw: &str) -> DomainResult<Vec<Question>> {
    let questions: Vec<Question> = serde_json::from_str(raw).map_err(|err| {
        DomainError::Validation(format!("stored questions of {survey_id} are corrupt: {err}"))
    })?;
    for question in &questions {
        question.check().map_err(|err| {
            DomainError::Validation(format!("stored questions of {survey_id} are corrupt: {err}"))
        })?;
    }
    Ok(questions)
}

pub(crate) fn encode_questions(questions: &[Question]) -> DomainResult<String> {
    serde_json::to_string(questions)
        .map_err(|err| DomainError::Validation(format!("failed to encode questions: {err}")))
}

/// Incoming create/update payload for one survey.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SurveyDraft {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub intro: String,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub outro: String,
    #[serde(default)]
    pub allow_multiple: bool,
    #[serde(default)]
    pub publish_date: Option<i64>,
    #[serde(default)]
    pub close_date: Option<i64>,
    /// Absent means "keep the stored question list".
    #[serde(default)]
    #[validate(length(max = 50))]
    pub questions: Option<Vec<Question>>,
}

impl SurveyDraft {
    pub fn parse(raw: &serde_json::Value) -> DomainResult<Self> {
        let draft: SurveyDraft = serde_json::from_value(raw.clone())
            .map_err(|err| DomainError::Validation(format!("invalid survey payload: {err}")))?;
        draft
            .validate()
            .map_err(|err| DomainError::Validation(format!("invalid survey payload: {err}")))?;
        draft.check_structure()?;
        Ok(draft)
    }

    fn check_structure(&self) -> DomainResult<()> {
        if self.title.trim().is_empty() {
            return Err(DomainError::Validation("title must not be blank".into()));
        }
        for (field, date) in [("publishDate", self.publish_date), ("closeDate", self.close_date)] {
            if date.is_some_and(|date| !(0..=MAX_TIMESTAMP_MS).contains(&date)) {
                return Err(DomainError::Validation(format!(
                    "{field} must be between 0 and {MAX_TIMESTAMP_MS}"
                )));
            }
        }
        if let (Some(publish), Some(close)) = (self.publish_date, self.close_date) {
            if close <= publish {
                return Err(DomainError::Validation(
                    "closeDate must be after publishDate".into(),
                ));
            }
        }
        if let Some(questions) = &self.questions {
            if questions.len() > MAX_QUESTIONS {
                return Err(DomainError::Validation(format!(
                    "a survey holds at most {MAX_QUESTIONS} questions"
                )));
            }
            let mut seen = HashSet::new();
            for question in questions {
                question.check()?;
                if !seen.insert(question.id.as_str()) {
                    return Err(DomainError::Validation(format!(
                        "duplicate question id {}",
                        question.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn into_config(
        self,
        survey_id: &str,
        owner_id: &str,
        create_date: i64,
    ) -> DomainResult<(SurveyConfig, Option<Vec<Question>>)> {
        validate_survey_id(survey_id)?;
        validate_user_id(owner_id)?;
        let config = SurveyConfig {
            id: survey_id.to_string(),
            owner: owner_id.to_string(),
            title: self.title.trim().to_string(),
            intro: self.intro,
            outro: self.outro,
            allow_multiple: self.allow_multiple,
            create_date,
            publish_date: self.publish_date,
            close_date: self.close_date,
            response_count: 0,
            delete_queued: false,
        };
        Ok((config, self.questions))
    }
}

/// A user's raw answer to one question: option values (ranked order for rank
/// questions) or a single string (scale value or free text).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AnswerValue {
    Many(Vec<String>),
    One(String),
}

impl AnswerValue {
    pub fn elements(&self) -> Vec<&str> {
        match self {
            AnswerValue::Many(values) => values.iter().map(String::as_str).collect(),
            AnswerValue::One(value) => vec![value.as_str()],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionTally {
    pub responses: BTreeMap<String, i64>,
    pub total: i64,
}

impl QuestionTally {
    pub fn score_sum(&self) -> i64 {
        self.responses.values().sum()
    }
}
