//! Broker side of the scheduler connection.
//!
//! A broker process runs a [`BrokerAgent`] that dials the scheduler, announces
//! its group and then executes the queue commands the scheduler sends against
//! a [`QueueBackend`].

mod agent;
mod backend;
mod errors;

pub use agent::{AgentOptions, AgentTls, BrokerAgent};
pub use backend::{MemoryQueues, QueueBackend};
pub use errors::{AgentError, Result};
