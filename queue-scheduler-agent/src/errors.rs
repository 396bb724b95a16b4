use queue_scheduler_core::SchedulerError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("scheduler refused the connection: {0}")]
    Refused(String),

    #[error("unexpected frame from the scheduler: {0}")]
    UnexpectedFrame(String),

    #[error("queue backend failure: {0}")]
    Backend(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] SchedulerError),

    #[error("agent task failed: {0}")]
    Task(String),
}
