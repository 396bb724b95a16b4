use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt::Debug;

use crate::{address::Address, errors::Result};

/// One live broker process, as seen by the scheduling engine.
///
/// Every call is a potentially slow remote operation that may fail or time out.
/// Implementations do not retry; creating an existing queue or deleting an
/// absent one must be tolerated by the broker side.
#[async_trait]
pub trait BrokerHandle: Send + Sync + Debug {
    /// Names of the queues currently hosted by the broker.
    async fn queue_names(&self) -> Result<HashSet<String>>;

    async fn create_queue(&self, address: &Address) -> Result<()>;

    async fn delete_queue(&self, address: &Address) -> Result<()>;
}
