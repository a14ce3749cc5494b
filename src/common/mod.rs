pub mod executor;

pub use executor::Executor;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Step failed: {0}")]
    Step(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ExecutionError {
    fn from(err: serde_json::Error) -> Self {
        ExecutionError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for ExecutionError {
    fn from(err: serde_yaml::Error) -> Self {
        ExecutionError::Parse(err.to_string())
    }
}

/// The context every executor runs under: a cancellation token plus the
/// logger binding (a job label prefixed to log lines).
#[derive(Clone)]
pub struct ExecutionContext {
    cancel: CancellationToken,
    job: Option<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        ExecutionContext {
            cancel: CancellationToken::new(),
            job: None,
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        ExecutionContext { cancel, job: None }
    }

    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A context that keeps the logger binding but can no longer be
    /// cancelled. Teardown stages run under this so that cancelling a job
    /// cannot leak its container.
    pub fn detached(&self) -> Self {
        ExecutionContext {
            cancel: CancellationToken::new(),
            job: self.job.clone(),
        }
    }

    pub fn log_debug(&self, message: &str) {
        crate::logging::debug(&self.prefixed(message));
    }

    pub fn log_info(&self, message: &str) {
        crate::logging::info(&self.prefixed(message));
    }

    pub fn log_warning(&self, message: &str) {
        crate::logging::warning(&self.prefixed(message));
    }

    pub fn log_error(&self, message: &str) {
        crate::logging::error(&self.prefixed(message));
    }

    fn prefixed(&self, message: &str) -> String {
        match &self.job {
            Some(job) => format!("[{}] {}", job, message),
            None => message.to_string(),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
