use thiserror::Error;

use super::BoxFuture;
use crate::error::DomainError;
use crate::survey::SurveyConfig;

#[derive(Debug, Error)]
pub enum PostError {
    #[error("post rejected by host: {0}")]
    Rejected(String),
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

impl From<PostError> for DomainError {
    fn from(err: PostError) -> Self {
        DomainError::Publish(err.to_string())
    }
}

/// Host-side "create post" operation. Returns the id of the live post.
pub trait PostPublisher: Send + Sync {
    fn create_survey_post(&self, survey: &SurveyConfig) -> BoxFuture<'_, Result<String, PostError>>;
}
