use thiserror::Error;

use super::BoxFuture;
use crate::error::DomainError;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account lookup failed: {0}")]
    Lookup(String),
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

impl From<AccountError> for DomainError {
    fn from(err: AccountError) -> Self {
        DomainError::Directory(err.to_string())
    }
}

pub trait AccountDirectory: Send + Sync {
    fn account_exists(&self, user_id: &str) -> BoxFuture<'_, Result<bool, AccountError>>;
}
