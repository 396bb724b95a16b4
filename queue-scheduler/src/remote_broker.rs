use async_trait::async_trait;
use dashmap::DashMap;
use queue_scheduler_core::protocol::{BrokerCommand, CommandOutcome, Frame, OpenRequest};
use queue_scheduler_core::{Address, BrokerHandle, Result, SchedulerError};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{trace, warn};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// A broker connection that completed the handshake.
///
/// Cloning is cheap and every clone talks over the same transport. Requests
/// are correlated with their responses by id through the pending table, which
/// the connection's reader task completes.
#[derive(Clone)]
pub struct BrokerConnection {
    open: Arc<OpenRequest>,
    peer_addr: SocketAddr,
    outbound: flume::Sender<Frame>,
    pending: Arc<DashMap<u64, oneshot::Sender<CommandOutcome>>>,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("container_id", &self.open.container_id)
            .field("peer_addr", &self.peer_addr)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BrokerConnection {
    pub fn new(open: OpenRequest, peer_addr: SocketAddr, outbound: flume::Sender<Frame>) -> Self {
        BrokerConnection {
            open: Arc::new(open),
            peer_addr,
            outbound,
            pending: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.open.container_id
    }

    pub fn group_id(&self) -> &str {
        self.open.group_id()
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.open.properties
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends `command` and waits up to `timeout` for the correlated outcome.
    pub async fn request(&self, command: BrokerCommand, timeout: Duration) -> Result<CommandOutcome> {
        if self.is_closed() {
            return Err(SchedulerError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let operation = command.name();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // close() may have drained the table between the check above and the insert
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(SchedulerError::Disconnected);
        }

        trace!(broker = %self.container_id(), id, operation, "sending request");
        if self
            .outbound
            .send_async(Frame::Request { id, command })
            .await
            .is_err()
        {
            self.pending.remove(&id);
            return Err(SchedulerError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(SchedulerError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(SchedulerError::timeout(operation))
            }
        }
    }

    /// Hands a response to the request waiting for it.
    pub(crate) fn complete(&self, id: u64, outcome: CommandOutcome) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => warn!(broker = %self.container_id(), id, "response for unknown or expired request"),
        }
    }

    /// Marks the connection closed and fails every in-flight request with `Disconnected`.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.clear();
    }
}

/// Builds the [`BrokerHandle`] the scheduler uses to drive a connected broker.
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    async fn create_broker(&self, connection: &BrokerConnection) -> Result<Arc<dyn BrokerHandle>>;
}

#[derive(Debug, Clone)]
pub struct RemoteBrokerFactory {
    rpc_timeout: Duration,
}

impl RemoteBrokerFactory {
    pub fn new(rpc_timeout: Duration) -> Self {
        RemoteBrokerFactory { rpc_timeout }
    }
}

impl Default for RemoteBrokerFactory {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_TIMEOUT)
    }
}

#[async_trait]
impl BrokerFactory for RemoteBrokerFactory {
    async fn create_broker(&self, connection: &BrokerConnection) -> Result<Arc<dyn BrokerHandle>> {
        if connection.is_closed() {
            return Err(SchedulerError::Disconnected);
        }
        Ok(Arc::new(RemoteBroker {
            connection: connection.clone(),
            rpc_timeout: self.rpc_timeout,
        }))
    }
}

/// Broker management over a [`BrokerConnection`]. Calls are never retried.
#[derive(Debug)]
pub struct RemoteBroker {
    connection: BrokerConnection,
    rpc_timeout: Duration,
}

impl RemoteBroker {
    async fn expect_done(&self, command: BrokerCommand) -> Result<()> {
        let operation = command.name();
        match self.connection.request(command, self.rpc_timeout).await? {
            CommandOutcome::Done => Ok(()),
            CommandOutcome::Failed { message } => Err(SchedulerError::BrokerRejected(message)),
            other => Err(SchedulerError::Protocol(format!(
                "unexpected outcome {:?} for {}",
                other, operation
            ))),
        }
    }
}

#[async_trait]
impl BrokerHandle for RemoteBroker {
    async fn queue_names(&self) -> Result<HashSet<String>> {
        match self
            .connection
            .request(BrokerCommand::ListQueues, self.rpc_timeout)
            .await?
        {
            CommandOutcome::Queues { names } => Ok(names.into_iter().collect()),
            CommandOutcome::Failed { message } => Err(SchedulerError::BrokerRejected(message)),
            other => Err(SchedulerError::Protocol(format!(
                "unexpected outcome {:?} for list_queues",
                other
            ))),
        }
    }

    async fn create_queue(&self, address: &Address) -> Result<()> {
        self.expect_done(BrokerCommand::CreateQueue {
            address: address.clone(),
        })
        .await
    }

    async fn delete_queue(&self, address: &Address) -> Result<()> {
        self.expect_done(BrokerCommand::DeleteQueue {
            address: address.clone(),
        })
        .await
    }
}
