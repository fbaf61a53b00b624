use thiserror::Error;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Error taxonomy shared by the store, engine, executor, and cron evaluator.
///
/// The API layer pattern-matches on these variants to pick an HTTP status;
/// see `scheduler::api::error` for that mapping.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("task is already running")]
    Conflict,

    #[error("dependencies are not met")]
    DependencyNotMet,

    #[error("malformed cron expression: {0}")]
    MalformedCron(String),

    #[error("cron schedule is unreachable within the lookahead window")]
    UnreachableSchedule,

    #[error("account '{0}' is not allowed")]
    AccountNotAllowed(String),

    #[error("privileged account required to run as '{0}'")]
    PrivilegeRequired(String),

    #[error("account '{0}' does not exist")]
    AccountMissing(String),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
