mod connection;

use metrics::{counter, gauge};
use queue_scheduler_core::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::remote_broker::BrokerFactory;
use crate::scheduler_metrics::{ACTIVE_CONNECTIONS, CONNECTIONS_TOTAL};
use crate::scheduler_worker::SchedulerHandle;
use connection::ConnectionContext;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: SocketAddr,
    /// Time allowed from accept until the `Open` frame is read, TLS handshake included.
    pub handshake_timeout: Duration,
}

impl ServerOptions {
    pub fn new(listen_addr: SocketAddr) -> Self {
        ServerOptions {
            listen_addr,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// SchedulerServer - terminates broker connections
///
/// Every accepted connection gets its own task which performs the handshake,
/// builds a broker handle through the [`BrokerFactory`] and turns the
/// connection lifecycle into `broker_added` / `broker_removed` calls on the
/// scheduler worker. The accept loop itself never waits on the scheduler.
///
/// Stopping the server closes the listener only; connections already
/// accepted keep running until their peer closes them.
pub struct SchedulerServer {
    options: ServerOptions,
    context: Arc<ConnectionContext>,
    tls: Option<TlsAcceptor>,
    running: Option<RunningServer>,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl SchedulerServer {
    pub fn new(
        options: ServerOptions,
        factory: Arc<dyn BrokerFactory>,
        scheduler: SchedulerHandle,
        authenticator: Arc<dyn Authenticator>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        let context = Arc::new(ConnectionContext {
            factory,
            scheduler,
            authenticator,
            handshake_timeout: options.handshake_timeout,
        });
        SchedulerServer {
            options,
            context,
            tls,
            running: None,
        }
    }

    /// Binds the listener and starts accepting brokers. Calling it on a running server is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.options.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.tls.clone(),
            Arc::clone(&self.context),
            shutdown_rx,
        ));

        info!(
            address = %local_addr,
            tls = self.tls.is_some(),
            "scheduler is listening for brokers"
        );
        self.running = Some(RunningServer {
            local_addr,
            shutdown_tx,
            accept_task,
        });
        Ok(())
    }

    /// Stops accepting connections and releases the listening socket. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        info!(address = %running.local_addr, "scheduler stopped listening");
    }

    /// Bound port, or 0 while the server is not listening.
    pub fn port(&self) -> u16 {
        self.running
            .as_ref()
            .map(|running| running.local_addr.port())
            .unwrap_or(0)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    context: Arc<ConnectionContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    counter!(CONNECTIONS_TOTAL.name).increment(1);
                    gauge!(ACTIVE_CONNECTIONS.name).increment(1.0);

                    let context = Arc::clone(&context);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        let deadline = Instant::now() + context.handshake_timeout;
                        match tls {
                            Some(acceptor) => context.serve_tls(acceptor, stream, peer, deadline).await,
                            None => context.serve(stream, peer, deadline).await,
                        }
                        gauge!(ACTIVE_CONNECTIONS.name).decrement(1.0);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept broker connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }
}
