use thiserror::Error;

use crate::ports::kv::KvError;
use crate::purge::PurgeCheckpoint;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("value {value} outside of range [{min}, {max}]")]
    Range { value: String, min: i64, max: i64 },
    #[error("execution budget exhausted during {0}")]
    ExecutionBudget(PurgeCheckpoint),
    #[error("transaction conflict")]
    TransactionConflict,
    #[error(transparent)]
    Store(#[from] KvError),
    #[error("post creation failed: {0}")]
    Publish(String),
    #[error("account directory failed: {0}")]
    Directory(String),
}

/// Coarse buckets callers map errors into for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retry,
    NotFound,
    Support,
}

impl DomainError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DomainError::TransactionConflict | DomainError::ExecutionBudget(_) => ErrorClass::Retry,
            DomainError::Store(KvError::Unavailable(_)) => ErrorClass::Retry,
            DomainError::NotFound(_) => ErrorClass::NotFound,
            _ => ErrorClass::Support,
        }
    }

    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, DomainError::ExecutionBudget(_))
    }
}
