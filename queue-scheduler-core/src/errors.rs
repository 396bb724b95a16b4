use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("broker {broker_id} is already registered in group {group}")]
    DuplicateBroker { group: String, broker_id: String },

    #[error("broker operation {operation} timed out")]
    Timeout { operation: String },

    #[error("broker rejected the operation: {0}")]
    BrokerRejected(String),

    #[error("broker connection is closed")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("connection is not authenticated: {0}")]
    Unauthenticated(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("scheduler worker has stopped")]
    WorkerStopped,
}

impl SchedulerError {
    pub fn timeout(operation: impl Into<String>) -> Self {
        SchedulerError::Timeout {
            operation: operation.into(),
        }
    }

    /// Errors that come from the remote broker rather than from the scheduler itself.
    pub fn is_broker_failure(&self) -> bool {
        matches!(
            self,
            SchedulerError::Timeout { .. }
                | SchedulerError::BrokerRejected(_)
                | SchedulerError::Disconnected
        )
    }
}
