use async_trait::async_trait;
use queue_scheduler_core::Address;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::errors::{AgentError, Result};

/// Queue management on the broker the agent runs for.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn list_queues(&self) -> Result<Vec<String>>;

    async fn create_queue(&self, address: &Address) -> Result<()>;

    async fn delete_queue(&self, address: &Address) -> Result<()>;
}

/// Process-local queues, keyed by name.
///
/// Creating an existing queue or deleting a missing one succeeds.
#[derive(Debug, Default)]
pub struct MemoryQueues {
    queues: Mutex<BTreeMap<String, Address>>,
    rejecting: AtomicBool,
}

impl MemoryQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current queue names, sorted.
    pub fn queue_names(&self) -> BTreeSet<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// While set, every create and delete is refused.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    fn check_accepting(&self) -> Result<()> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(AgentError::Backend("broker is refusing changes".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Address>> {
        // a poisoned map is still a consistent map of queues
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueBackend for MemoryQueues {
    async fn list_queues(&self) -> Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    async fn create_queue(&self, address: &Address) -> Result<()> {
        self.check_accepting()?;
        self.lock()
            .entry(address.name.clone())
            .or_insert_with(|| address.clone());
        Ok(())
    }

    async fn delete_queue(&self, address: &Address) -> Result<()> {
        self.check_accepting()?;
        self.lock().remove(&address.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_delete_are_idempotent() {
        let queues = MemoryQueues::new();
        let address = Address::new("queue1", "pooled-inmemory");

        queues.create_queue(&address).await.unwrap();
        queues.create_queue(&address).await.unwrap();
        assert_eq!(queues.list_queues().await.unwrap(), vec!["queue1".to_string()]);

        queues.delete_queue(&address).await.unwrap();
        queues.delete_queue(&address).await.unwrap();
        assert!(queues.is_empty());
    }

    #[tokio::test]
    async fn rejecting_backend_refuses_changes() {
        let queues = MemoryQueues::new();
        queues.set_rejecting(true);

        let err = queues
            .create_queue(&Address::new("queue1", "standard"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Backend(_)));
        assert!(queues.is_empty());
    }
}
