use queue_scheduler_core::protocol::{
    read_frame, write_frame, BrokerCommand, CommandOutcome, Frame, OpenRequest,
    GROUP_ID_PROPERTY,
};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::backend::QueueBackend;
use crate::errors::{AgentError, Result};

/// Identity a broker announces when it connects.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub container_id: String,
    /// Sent as the group property; the scheduler falls back to the container id without it.
    pub group_id: Option<String>,
    pub properties: HashMap<String, String>,
}

impl AgentOptions {
    pub fn new(container_id: impl Into<String>) -> Self {
        AgentOptions {
            container_id: container_id.into(),
            ..Default::default()
        }
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn open_request(&self) -> OpenRequest {
        let mut open = OpenRequest::new(self.container_id.clone());
        open.properties = self.properties.clone();
        if let Some(group_id) = &self.group_id {
            open.properties
                .insert(GROUP_ID_PROPERTY.to_string(), group_id.clone());
        }
        open
    }
}

/// Client side TLS material: the CA that signed the scheduler certificate and
/// the broker's own certificate and key.
#[derive(Clone)]
pub struct AgentTls {
    connector: TlsConnector,
}

impl AgentTls {
    pub fn from_pem_files(
        ca_path: impl AsRef<Path>,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for ca in load_certs(ca_path.as_ref())? {
            roots
                .add(ca)
                .map_err(|e| AgentError::Tls(format!("invalid CA certificate: {}", e)))?;
        }

        let certs = load_certs(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;

        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| AgentError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| AgentError::Tls(e.to_string()))?;

        Ok(AgentTls {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

/// A live connection from a broker to the scheduler.
///
/// After the handshake a background task answers the scheduler's requests
/// with the outcome of the matching [`QueueBackend`] call. The task ends when
/// the scheduler closes the connection or [`BrokerAgent::close`] is called.
/// Dropping the agent closes the connection as well.
pub struct BrokerAgent {
    container_id: String,
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl BrokerAgent {
    pub async fn connect(
        addr: SocketAddr,
        options: AgentOptions,
        backend: Arc<dyn QueueBackend>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::establish(stream, options, backend).await
    }

    pub async fn connect_tls(
        addr: SocketAddr,
        server_name: &str,
        options: AgentOptions,
        backend: Arc<dyn QueueBackend>,
        tls: &AgentTls,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| AgentError::InvalidServerName(server_name.to_string()))?;

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let stream = tls.connector.connect(server_name, stream).await?;
        Self::establish(stream, options, backend).await
    }

    /// Runs the handshake over `stream` and starts serving requests.
    pub async fn establish<S>(
        stream: S,
        options: AgentOptions,
        backend: Arc<dyn QueueBackend>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_frame(&mut writer, &Frame::Open(options.open_request())).await?;
        match read_frame(&mut reader).await? {
            Some(Frame::OpenOk { container_id }) => {
                info!(broker = %options.container_id, scheduler = %container_id, "connected to scheduler")
            }
            Some(Frame::Close { reason }) => {
                return Err(AgentError::Refused(
                    reason.unwrap_or_else(|| "no reason given".to_string()),
                ))
            }
            Some(other) => return Err(AgentError::UnexpectedFrame(format!("{:?}", other))),
            None => return Err(AgentError::Refused("connection closed".to_string())),
        }

        let (close_tx, close_rx) = oneshot::channel();
        let container_id = options.container_id;
        let task = tokio::spawn(serve(
            reader,
            writer,
            backend,
            close_rx,
            container_id.clone(),
        ));

        Ok(BrokerAgent {
            container_id,
            close_tx: Some(close_tx),
            task,
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Whether the connection already ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Sends `Close` to the scheduler and waits for the connection task to end.
    pub async fn close(mut self) -> Result<()> {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        self.join().await
    }

    /// Waits until the scheduler ends the connection.
    pub async fn closed(mut self) -> Result<()> {
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        (&mut self.task)
            .await
            .map_err(|e| AgentError::Task(e.to_string()))?
    }
}

async fn serve<S>(
    mut reader: ReadHalf<S>,
    mut writer: WriteHalf<S>,
    backend: Arc<dyn QueueBackend>,
    mut close_rx: oneshot::Receiver<()>,
    container_id: String,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            // resolves on close() and when the agent is dropped
            _ = &mut close_rx => {
                debug!(broker = %container_id, "closing scheduler connection");
                let close = Frame::Close {
                    reason: Some("broker shutting down".to_string()),
                };
                write_frame(&mut writer, &close).await?;
                writer.shutdown().await?;
                return Ok(());
            }
            frame = read_frame(&mut reader) => match frame? {
                Some(Frame::Request { id, command }) => {
                    let outcome = execute(backend.as_ref(), command).await;
                    write_frame(&mut writer, &Frame::Response { id, outcome }).await?;
                }
                Some(Frame::Close { reason }) => {
                    info!(broker = %container_id, reason = ?reason, "scheduler closed the connection");
                    return Ok(());
                }
                Some(other) => {
                    warn!(broker = %container_id, frame = ?other, "ignoring unexpected frame");
                }
                None => {
                    info!(broker = %container_id, "scheduler connection dropped");
                    return Ok(());
                }
            }
        }
    }
}

async fn execute(backend: &dyn QueueBackend, command: BrokerCommand) -> CommandOutcome {
    let result = match &command {
        BrokerCommand::ListQueues => {
            return match backend.list_queues().await {
                Ok(names) => CommandOutcome::Queues { names },
                Err(e) => CommandOutcome::Failed {
                    message: e.to_string(),
                },
            }
        }
        BrokerCommand::CreateQueue { address } => backend.create_queue(address).await,
        BrokerCommand::DeleteQueue { address } => backend.delete_queue(address).await,
    };

    match result {
        Ok(()) => CommandOutcome::Done,
        Err(e) => {
            warn!(operation = command.name(), error = %e, "queue command failed");
            CommandOutcome::Failed {
                message: e.to_string(),
            }
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| AgentError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AgentError::Tls(format!("cannot parse {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(AgentError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| AgentError::Tls(format!("cannot open {}: {}", path.display(), e)))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| AgentError::Tls(format!("cannot parse {}: {}", path.display(), e)))?
        .ok_or_else(|| AgentError::Tls(format!("no private key found in {}", path.display())))
}
