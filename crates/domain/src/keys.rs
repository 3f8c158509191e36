//! Store key layout. Every builder validates the identifiers it embeds so a
//! malformed id from upstream can never address a foreign key.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::DomainResult;
use crate::error::DomainError;

const ID_SUFFIX_LEN: usize = 10;
const SURVEY_ID_PREFIX: &str = "sv_";
const QUESTION_ID_PREFIX: &str = "qn_";
const OPTION_ID_PREFIX: &str = "op_";

static SURVEY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sv_[a-zA-Z0-9]{10}$").expect("survey id pattern"));
static QUESTION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^qn_[a-zA-Z0-9]{10}$").expect("question id pattern"));
static OPTION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^op_[a-zA-Z0-9]{10}$").expect("option id pattern"));
static USER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^t2_[a-z0-9]{1,16}$").expect("user id pattern"));

fn check(pattern: &Regex, kind: &str, value: &str) -> DomainResult<()> {
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(DomainError::Validation(format!("malformed {kind} id '{value}'")))
    }
}

pub fn validate_survey_id(value: &str) -> DomainResult<()> {
    check(&SURVEY_ID, "survey", value)
}

pub fn validate_question_id(value: &str) -> DomainResult<()> {
    check(&QUESTION_ID, "question", value)
}

pub fn validate_option_id(value: &str) -> DomainResult<()> {
    check(&OPTION_ID, "option", value)
}

pub fn validate_user_id(value: &str) -> DomainResult<()> {
    check(&USER_ID, "user", value)
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..ID_SUFFIX_LEN].to_string()
}

pub fn new_survey_id() -> String {
    format!("{SURVEY_ID_PREFIX}{}", random_suffix())
}

pub fn new_question_id() -> String {
    format!("{QUESTION_ID_PREFIX}{}", random_suffix())
}

pub fn new_option_id() -> String {
    format!("{OPTION_ID_PREFIX}{}", random_suffix())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySchema {
    prefix: String,
}

impl KeySchema {
    /// `prefix` namespaces every key (`{prefix}:survey-config:...`); empty
    /// means no namespace.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches(':').to_string(),
        }
    }

    fn key(&self, body: String) -> String {
        if self.prefix.is_empty() {
            body
        } else {
            format!("{}:{body}", self.prefix)
        }
    }

    pub fn survey_config(&self, survey_id: &str) -> DomainResult<String> {
        validate_survey_id(survey_id)?;
        Ok(self.key(format!("survey-config:{survey_id}")))
    }

    pub fn survey_questions(&self, survey_id: &str) -> DomainResult<String> {
        validate_survey_id(survey_id)?;
        Ok(self.key(format!("survey-questions:{survey_id}")))
    }

    /// Id of the live post created for the survey.
    pub fn survey_post(&self, survey_id: &str) -> DomainResult<String> {
        validate_survey_id(survey_id)?;
        Ok(self.key(format!("survey-post:{survey_id}")))
    }

    pub fn owner_index(&self, owner_id: &str) -> DomainResult<String> {
        validate_user_id(owner_id)?;
        Ok(self.key(format!("owner-index:{owner_id}")))
    }

    pub fn owner_registry(&self) -> String {
        self.key("owner-registry".to_string())
    }

    pub fn responder_roster(&self, survey_id: &str) -> DomainResult<String> {
        validate_survey_id(survey_id)?;
        Ok(self.key(format!("responder-roster:{survey_id}")))
    }

    pub fn question_tally(&self, survey_id: &str, question_id: &str) -> DomainResult<String> {
        validate_survey_id(survey_id)?;
        validate_question_id(question_id)?;
        Ok(self.key(format!("question-tally:{survey_id}:{question_id}")))
    }

    pub fn user_answer(&self, user_id: &str, survey_id: &str) -> DomainResult<String> {
        validate_user_id(user_id)?;
        validate_survey_id(survey_id)?;
        Ok(self.key(format!("user-answer:{user_id}:{survey_id}")))
    }

    pub fn publish_queue(&self) -> String {
        self.key("publish-queue".to_string())
    }

    pub fn delete_queue(&self) -> String {
        self.key("delete-queue".to_string())
    }

    pub fn purge_lease(&self, survey_id: &str) -> DomainResult<String> {
        validate_survey_id(survey_id)?;
        Ok(self.key(format!("purge-lease:{survey_id}")))
    }

    pub fn liveness_checks(&self) -> String {
        self.key("liveness-checks".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_pass_their_own_validation() {
        for _ in 0..32 {
            validate_survey_id(&new_survey_id()).expect("survey id");
            validate_question_id(&new_question_id()).expect("question id");
            validate_option_id(&new_option_id()).expect("option id");
        }
    }

    #[test]
    fn rejects_wrong_prefix_and_length() {
        assert!(validate_survey_id("qn_abcdefghij").is_err());
        assert!(validate_survey_id("sv_abcdefghi").is_err());
        assert!(validate_survey_id("sv_abcdefghijk").is_err());
        assert!(validate_option_id("op_abc-efghij").is_err());
        assert!(validate_user_id("t2_").is_err());
        assert!(validate_user_id("t2_ABC").is_err());
        assert!(validate_user_id("t2_abc123").is_ok());
    }

    #[test]
    fn keys_embed_validated_ids() {
        let keys = KeySchema::new("quorum:");
        assert_eq!(
            keys.question_tally("sv_abcdefghij", "qn_0123456789")
                .unwrap(),
            "quorum:question-tally:sv_abcdefghij:qn_0123456789"
        );
        assert_eq!(
            keys.user_answer("t2_abc", "sv_abcdefghij").unwrap(),
            "quorum:user-answer:t2_abc:sv_abcdefghij"
        );
        assert_eq!(
            keys.survey_post("sv_abcdefghij").unwrap(),
            "quorum:survey-post:sv_abcdefghij"
        );
        assert_eq!(KeySchema::default().publish_queue(), "publish-queue");
    }

    #[test]
    fn keys_fail_fast_on_malformed_ids() {
        let keys = KeySchema::default();
        let err = keys
            .survey_config("sv_../../etc")
            .expect_err("malformed id must be rejected");
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(keys.user_answer("admin", "sv_abcdefghij").is_err());
        assert!(keys.question_tally("sv_abcdefghij", "op_0123456789").is_err());
    }
}
