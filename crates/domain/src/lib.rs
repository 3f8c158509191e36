pub mod context;
pub mod error;
pub mod host;
pub mod jobs;
pub mod keys;
pub mod liveness;
pub mod memory;
pub mod ports;
pub mod publishing;
pub mod purge;
pub mod responses;
pub mod retry;
pub mod survey;
pub mod surveys;

pub type DomainResult<T> = Result<T, error::DomainError>;
