use flume::{Receiver, Sender};
use metrics::counter;
use queue_scheduler_core::{BrokerHandle, Result, SchedulerError};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::scheduler_metrics::PLACEMENT_FAILURES_TOTAL;
use crate::scheduler_state::{AddressSnapshot, SchedulerEvent, SchedulerState};

/// Commands processed one at a time by the scheduler worker
#[derive(Debug)]
pub(crate) enum SchedulerCommand {
    AddressesChanged {
        snapshot: AddressSnapshot,
        response_tx: Sender<Result<()>>,
    },
    BrokerAdded {
        group: String,
        broker_id: String,
        broker: Arc<dyn BrokerHandle>,
        response_tx: Sender<Result<()>>,
    },
    BrokerRemoved {
        group: String,
        broker_id: String,
        response_tx: Sender<Result<()>>,
    },
    Shutdown,
}

/// Single owner of the [`SchedulerState`].
///
/// Every event source (connections, configuration feed) goes through the
/// worker's queue, so only one scheduling event runs at a time, in arrival
/// order, including the broker calls it issues.
#[derive(Debug)]
pub struct SchedulerWorker {
    state: SchedulerState,
    command_rx: Receiver<SchedulerCommand>,
}

impl SchedulerWorker {
    /// Starts the worker in a background task and returns the handle used to feed it.
    pub fn spawn(state: SchedulerState) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = flume::unbounded();
        let handle = SchedulerHandle {
            command_tx,
            events: state.event_sender(),
        };

        let worker = SchedulerWorker { state, command_rx };
        (handle, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        info!("scheduler worker started");

        loop {
            match self.command_rx.recv_async().await {
                Ok(SchedulerCommand::AddressesChanged {
                    snapshot,
                    response_tx,
                }) => {
                    let groups = snapshot.len();
                    let result = self.state.addresses_changed(snapshot).await;
                    Self::log_outcome("addresses changed", &result);
                    if let Err(e) = result.as_ref() {
                        warn!(groups, error = %e, "address snapshot only partially applied");
                    }
                    Self::respond(response_tx, result).await;
                }
                Ok(SchedulerCommand::BrokerAdded {
                    group,
                    broker_id,
                    broker,
                    response_tx,
                }) => {
                    let result = self.state.broker_added(&group, &broker_id, broker).await;
                    Self::log_outcome("broker added", &result);
                    Self::respond(response_tx, result).await;
                }
                Ok(SchedulerCommand::BrokerRemoved {
                    group,
                    broker_id,
                    response_tx,
                }) => {
                    let result = self.state.broker_removed(&group, &broker_id).await;
                    Self::log_outcome("broker removed", &result);
                    Self::respond(response_tx, result).await;
                }
                Ok(SchedulerCommand::Shutdown) => {
                    info!("scheduler worker shutting down");
                    break;
                }
                Err(flume::RecvError::Disconnected) => {
                    warn!("scheduler worker channel disconnected");
                    break;
                }
            }
        }

        info!("scheduler worker stopped");
    }

    fn log_outcome(event: &str, result: &Result<()>) {
        match result {
            Ok(()) => debug!(event, "scheduling event processed"),
            Err(e) if e.is_broker_failure() => {
                counter!(PLACEMENT_FAILURES_TOTAL.name).increment(1);
                error!(event, error = %e, "placement abandoned after broker failure");
            }
            Err(e) => error!(event, error = %e, "scheduling event failed"),
        }
    }

    async fn respond(response_tx: Sender<Result<()>>, result: Result<()>) {
        if response_tx.send_async(result).await.is_err() {
            debug!("caller stopped waiting for the scheduling result");
        }
    }
}

/// Cloneable entry point to the scheduler worker.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    command_tx: Sender<SchedulerCommand>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub async fn addresses_changed(&self, snapshot: AddressSnapshot) -> Result<()> {
        let (response_tx, response_rx) = flume::bounded(1);
        self.submit(SchedulerCommand::AddressesChanged {
            snapshot,
            response_tx,
        })
        .await?;
        response_rx
            .recv_async()
            .await
            .map_err(|_| SchedulerError::WorkerStopped)?
    }

    pub async fn broker_added(
        &self,
        group: &str,
        broker_id: &str,
        broker: Arc<dyn BrokerHandle>,
    ) -> Result<()> {
        let (response_tx, response_rx) = flume::bounded(1);
        self.submit(SchedulerCommand::BrokerAdded {
            group: group.to_string(),
            broker_id: broker_id.to_string(),
            broker,
            response_tx,
        })
        .await?;
        response_rx
            .recv_async()
            .await
            .map_err(|_| SchedulerError::WorkerStopped)?
    }

    pub async fn broker_removed(&self, group: &str, broker_id: &str) -> Result<()> {
        let (response_tx, response_rx) = flume::bounded(1);
        self.submit(SchedulerCommand::BrokerRemoved {
            group: group.to_string(),
            broker_id: broker_id.to_string(),
            response_tx,
        })
        .await?;
        response_rx
            .recv_async()
            .await
            .map_err(|_| SchedulerError::WorkerStopped)?
    }

    /// Events emitted by the scheduler state after each processed command.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Asks the worker to stop once the commands queued before this one are done.
    pub async fn shutdown(&self) {
        if self.submit(SchedulerCommand::Shutdown).await.is_err() {
            debug!("scheduler worker already stopped");
        }
    }

    async fn submit(&self, command: SchedulerCommand) -> Result<()> {
        self.command_tx
            .send_async(command)
            .await
            .map_err(|_| SchedulerError::WorkerStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use queue_scheduler_core::Address;
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Broker whose calls take a while, to expose interleaving.
    #[derive(Debug, Default)]
    struct SlowBroker {
        queues: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl BrokerHandle for SlowBroker {
        async fn queue_names(&self) -> Result<HashSet<String>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.queues.lock().unwrap().clone())
        }

        async fn create_queue(&self, address: &Address) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.queues.lock().unwrap().insert(address.name.clone());
            Ok(())
        }

        async fn delete_queue(&self, address: &Address) -> Result<()> {
            self.queues.lock().unwrap().remove(&address.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_callers_are_serialized() {
        let (handle, worker) = SchedulerWorker::spawn(SchedulerState::new());
        let mut events = handle.subscribe();

        let addresses: BTreeSet<Address> = (0..4)
            .map(|i| Address::new(format!("queue{}", i), "pooled-inmemory"))
            .collect();

        let feed = handle.clone();
        let push = tokio::spawn(async move {
            feed.addresses_changed(HashMap::from([("pooled-inmemory".to_string(), addresses)]))
                .await
        });

        let brokers: Vec<Arc<SlowBroker>> = (0..2).map(|_| Arc::new(SlowBroker::default())).collect();
        let mut joins = Vec::new();
        for (idx, broker) in brokers.iter().enumerate() {
            let handle = handle.clone();
            let broker: Arc<dyn BrokerHandle> = broker.clone();
            joins.push(tokio::spawn(async move {
                handle
                    .broker_added("pooled-inmemory", &format!("broker-{}", idx), broker)
                    .await
            }));
        }

        push.await.unwrap().unwrap();
        for join in joins {
            join.await.unwrap().unwrap();
        }

        let total: usize = brokers.iter().map(|b| b.queues.lock().unwrap().len()).sum();
        assert_eq!(total, 4, "every address placed exactly once");

        let mut seen = 0;
        while let Ok(event) = events.try_recv() {
            seen += 1;
            assert!(matches!(
                event,
                SchedulerEvent::AddressesChanged { .. } | SchedulerEvent::BrokerAdded { .. }
            ));
        }
        assert_eq!(seen, 3);

        handle.shutdown().await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn errors_are_returned_and_worker_keeps_running() {
        let (handle, worker) = SchedulerWorker::spawn(SchedulerState::new());
        let broker: Arc<dyn BrokerHandle> = Arc::new(SlowBroker::default());

        handle.broker_added("g", "b1", broker.clone()).await.unwrap();
        let err = handle.broker_added("g", "b1", broker).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateBroker { .. }));

        handle.broker_removed("g", "b1").await.unwrap();

        handle.shutdown().await;
        worker.await.unwrap();

        let err = handle.broker_removed("g", "b1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerStopped));
    }
}
