use queue_scheduler_core::protocol::{
    read_frame, write_frame, Frame, OpenRequest, SCHEDULER_CONTAINER_ID,
};
use queue_scheduler_core::{Result, SchedulerError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::remote_broker::{BrokerConnection, BrokerFactory};
use crate::scheduler_worker::SchedulerHandle;

/// Lifecycle of one broker connection once the handshake succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connected,
    Registered,
    Closing,
    Closed,
}

/// Everything a connection task needs, shared by all connections of a server.
pub(super) struct ConnectionContext {
    pub(super) factory: Arc<dyn BrokerFactory>,
    pub(super) scheduler: SchedulerHandle,
    pub(super) authenticator: Arc<dyn Authenticator>,
    pub(super) handshake_timeout: Duration,
}

impl ConnectionContext {
    pub(super) async fn serve_tls(
        &self,
        acceptor: TlsAcceptor,
        stream: TcpStream,
        peer: SocketAddr,
        deadline: Instant,
    ) {
        match tokio::time::timeout_at(deadline, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => self.serve(stream, peer, deadline).await,
            Ok(Err(e)) => warn!(peer = %peer, error = %e, "TLS handshake failed"),
            Err(_) => warn!(peer = %peer, "TLS handshake timed out"),
        }
    }

    /// Drives one connection from the `Open` frame until both halves are closed.
    ///
    /// `deadline` bounds the whole handshake and is shared with the TLS accept.
    pub(super) async fn serve<S>(&self, stream: S, peer: SocketAddr, deadline: Instant)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let open = match self.handshake(&mut reader, &mut writer, deadline).await {
            Ok(open) => open,
            Err(e) => {
                warn!(peer = %peer, error = %e, "broker handshake rejected");
                let close = Frame::Close {
                    reason: Some(e.to_string()),
                };
                let _ = write_frame(&mut writer, &close).await;
                let _ = writer.shutdown().await;
                return;
            }
        };

        let (outbound_tx, outbound_rx) = flume::unbounded();
        let connection = BrokerConnection::new(open, peer, outbound_tx.clone());
        let group = connection.group_id().to_string();
        let broker_id = connection.container_id().to_string();

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
        let reader_task = tokio::spawn(read_loop(reader, connection.clone()));

        let mut state = ConnectionState::Connected;
        info!(peer = %peer, group = %group, broker_id = %broker_id, "broker connected");

        if self.register(&connection, &group, &broker_id).await {
            state = ConnectionState::Registered;
            match reader_task.await {
                Ok(Some(reason)) => {
                    info!(group = %group, broker_id = %broker_id, reason = %reason, "broker closed the connection")
                }
                Ok(None) => info!(group = %group, broker_id = %broker_id, "broker disconnected"),
                Err(e) => warn!(group = %group, broker_id = %broker_id, error = %e, "connection reader failed"),
            }
        } else {
            reader_task.abort();
        }

        let registered = state == ConnectionState::Registered;
        state = ConnectionState::Closing;
        debug!(group = %group, broker_id = %broker_id, ?state, "releasing connection");
        connection.close();

        if registered {
            if let Err(e) = self.scheduler.broker_removed(&group, &broker_id).await {
                warn!(group = %group, broker_id = %broker_id, error = %e, "failed to deregister broker");
            }
        }

        let _ = outbound_tx
            .send_async(Frame::Close { reason: None })
            .await;
        drop(outbound_tx);
        if let Err(e) = writer_task.await {
            warn!(group = %group, broker_id = %broker_id, error = %e, "connection writer failed");
        }

        state = ConnectionState::Closed;
        debug!(group = %group, broker_id = %broker_id, ?state, "connection released");
    }

    /// Reads the `Open` frame, authenticates it and answers with `OpenOk`.
    async fn handshake<S>(
        &self,
        reader: &mut ReadHalf<S>,
        writer: &mut WriteHalf<S>,
        deadline: Instant,
    ) -> Result<OpenRequest>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = tokio::time::timeout_at(deadline, read_frame(reader))
            .await
            .map_err(|_| SchedulerError::timeout("open"))??;

        let open = match frame {
            Some(Frame::Open(open)) => open,
            Some(other) => {
                return Err(SchedulerError::Protocol(format!(
                    "expected an open frame, received {:?}",
                    other
                )))
            }
            None => return Err(SchedulerError::Disconnected),
        };

        if open.container_id.is_empty() {
            return Err(SchedulerError::Protocol(
                "open frame carries no container id".to_string(),
            ));
        }
        self.authenticator.authenticate(&open)?;

        write_frame(
            writer,
            &Frame::OpenOk {
                container_id: SCHEDULER_CONTAINER_ID.to_string(),
            },
        )
        .await?;
        Ok(open)
    }

    /// Builds the broker handle and registers it. Returns whether the scheduler now holds the broker.
    async fn register(&self, connection: &BrokerConnection, group: &str, broker_id: &str) -> bool {
        let broker = match self.factory.create_broker(connection).await {
            Ok(broker) => broker,
            Err(e) => {
                warn!(group = %group, broker_id = %broker_id, error = %e, "failed to create broker handle");
                return false;
            }
        };

        match self.scheduler.broker_added(group, broker_id, broker).await {
            Ok(()) => true,
            Err(e @ (SchedulerError::DuplicateBroker { .. } | SchedulerError::WorkerStopped)) => {
                warn!(group = %group, broker_id = %broker_id, error = %e, "broker registration refused");
                false
            }
            // any other error comes from the initial placement, after the broker was registered
            Err(e) => {
                warn!(group = %group, broker_id = %broker_id, error = %e, "initial placement failed");
                true
            }
        }
    }
}

/// Completes pending requests until the peer closes. Returns the close reason, if any was sent.
async fn read_loop<S>(mut reader: ReadHalf<S>, connection: BrokerConnection) -> Option<String>
where
    S: AsyncRead + Unpin,
{
    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Response { id, outcome })) => connection.complete(id, outcome),
            Ok(Some(Frame::Close { reason })) => {
                break Some(reason.unwrap_or_else(|| "closed by peer".to_string()))
            }
            Ok(Some(other)) => {
                warn!(broker_id = %connection.container_id(), frame = ?other, "ignoring unexpected frame")
            }
            Ok(None) => break None,
            Err(e) => {
                warn!(broker_id = %connection.container_id(), error = %e, "connection read failed");
                break None;
            }
        }
    };

    connection.close();
    reason
}

async fn write_loop<S>(mut writer: WriteHalf<S>, outbound_rx: flume::Receiver<Frame>)
where
    S: AsyncWrite + Unpin,
{
    while let Ok(frame) = outbound_rx.recv_async().await {
        let closing = matches!(frame, Frame::Close { .. });
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "connection write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
