#![allow(dead_code)]

use anyhow::{bail, Result};
use queue_scheduler::auth::{AllowAll, Authenticator};
use queue_scheduler::{
    AddressSnapshot, RemoteBrokerFactory, SchedulerEvent, SchedulerHandle, SchedulerServer,
    SchedulerState, SchedulerWorker, ServerOptions,
};
use queue_scheduler::tls::{CA_FILE, CERT_FILE, KEY_FILE};
use queue_scheduler_agent::{AgentOptions, AgentTls, BrokerAgent, MemoryQueues, QueueBackend};
use queue_scheduler_core::{group_addresses, Address};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const POOLED_INMEMORY: &str = "pooled-inmemory";
pub const POOLED_PERSISTED: &str = "pooled-persisted";

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Name the scheduler certificate is issued for.
pub const TLS_SERVER_NAME: &str = "localhost";

/// Scheduler listening on an ephemeral local port.
pub struct TestScheduler {
    pub server: SchedulerServer,
    pub handle: SchedulerHandle,
    pub brokers: BrokerTracker,
    worker: JoinHandle<()>,
}

impl TestScheduler {
    pub async fn start() -> Result<Self> {
        Self::start_with(Arc::new(AllowAll), Duration::from_secs(5)).await
    }

    pub async fn start_with(
        authenticator: Arc<dyn Authenticator>,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        let options = ServerOptions::new("127.0.0.1:0".parse()?);
        Self::launch(options, authenticator, rpc_timeout, None).await
    }

    /// Requires brokers to connect over mutual TLS.
    pub async fn start_tls(acceptor: TlsAcceptor, handshake_timeout: Duration) -> Result<Self> {
        let mut options = ServerOptions::new("127.0.0.1:0".parse()?);
        options.handshake_timeout = handshake_timeout;
        Self::launch(options, Arc::new(AllowAll), Duration::from_secs(5), Some(acceptor)).await
    }

    async fn launch(
        options: ServerOptions,
        authenticator: Arc<dyn Authenticator>,
        rpc_timeout: Duration,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let (handle, worker) = SchedulerWorker::spawn(SchedulerState::new());
        let brokers = BrokerTracker::follow(&handle);

        let mut server = SchedulerServer::new(
            options,
            Arc::new(RemoteBrokerFactory::new(rpc_timeout)),
            handle.clone(),
            authenticator,
            tls,
        );
        server.start().await?;

        Ok(TestScheduler {
            server,
            handle,
            brokers,
            worker,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.server.port()))
    }

    /// Connects a broker whose group falls back to its container id.
    pub async fn broker(&self, container_id: &str) -> Result<TestBroker> {
        TestBroker::connect(self.addr(), AgentOptions::new(container_id)).await
    }

    pub async fn broker_in_group(&self, container_id: &str, group: &str) -> Result<TestBroker> {
        TestBroker::connect(self.addr(), AgentOptions::new(container_id).group(group)).await
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.server.stop().await;
        self.handle.shutdown().await;
        self.worker.await?;
        Ok(())
    }
}

pub struct TestBroker {
    pub agent: BrokerAgent,
    pub queues: Arc<MemoryQueues>,
}

impl TestBroker {
    pub async fn connect(addr: SocketAddr, options: AgentOptions) -> Result<Self> {
        let queues = Arc::new(MemoryQueues::new());
        let backend: Arc<dyn QueueBackend> = queues.clone();
        let agent = BrokerAgent::connect(addr, options, backend).await?;
        Ok(TestBroker { agent, queues })
    }

    pub async fn connect_tls(addr: SocketAddr, options: AgentOptions, tls: &AgentTls) -> Result<Self> {
        let queues = Arc::new(MemoryQueues::new());
        let backend: Arc<dyn QueueBackend> = queues.clone();
        let agent = BrokerAgent::connect_tls(addr, TLS_SERVER_NAME, options, backend, tls).await?;
        Ok(TestBroker { agent, queues })
    }

    pub fn queue_names(&self) -> BTreeSet<String> {
        self.queues.queue_names()
    }

    /// Waits until the broker hosts exactly `count` queues.
    pub async fn wait_for_queues(&self, count: usize) -> Result<()> {
        let queues = Arc::clone(&self.queues);
        wait_until(&format!("{} queues on {}", count, self.agent.container_id()), || {
            queues.len() == count
        })
        .await
    }
}

/// Throwaway CA with one scheduler and one broker certificate, written to a
/// temporary directory laid out the way the scheduler's TLS directory is.
pub struct TestPki {
    dir: TempDir,
    ca_cert: CertificateDer<'static>,
    broker_cert: CertificateDer<'static>,
    broker_key: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> Result<Self> {
        let ca_key = KeyPair::generate()?;
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "queue scheduler test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key)?;

        let server_key = KeyPair::generate()?;
        let mut server_params = CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])?;
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params.signed_by(&server_key, &ca, &ca_key)?;

        let broker_key = KeyPair::generate()?;
        let mut broker_params = CertificateParams::new(vec!["broker-0".to_string()])?;
        broker_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let broker = broker_params.signed_by(&broker_key, &ca, &ca_key)?;

        let dir = TempDir::new()?;
        fs::write(dir.path().join(CA_FILE), ca.pem())?;
        fs::write(dir.path().join(CERT_FILE), server.pem())?;
        fs::write(dir.path().join(KEY_FILE), server_key.serialize_pem())?;
        fs::write(dir.path().join("broker.crt"), broker.pem())?;
        fs::write(dir.path().join("broker.key"), broker_key.serialize_pem())?;

        Ok(TestPki {
            dir,
            ca_cert: ca.der().clone(),
            broker_cert: broker.der().clone(),
            broker_key: broker_key.serialize_der(),
        })
    }

    /// Directory holding `tls.key`, `tls.crt` and `ca.crt` for the scheduler.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn agent_tls(&self) -> Result<AgentTls> {
        Ok(AgentTls::from_pem_files(
            self.file(CA_FILE),
            self.file("broker.crt"),
            self.file("broker.key"),
        )?)
    }

    /// Raw client connector trusting the test CA, with or without the broker certificate.
    pub fn connector(&self, with_client_cert: bool) -> Result<TlsConnector> {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.clone())?;

        let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);
        let config = if with_client_cert {
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.broker_key.clone()));
            builder.with_client_auth_cert(vec![self.broker_cert.clone()], key)?
        } else {
            builder.with_no_client_auth()
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }

    pub fn server_name(&self) -> Result<ServerName<'static>> {
        Ok(ServerName::try_from(TLS_SERVER_NAME)?)
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Broker ids currently registered, rebuilt from the scheduler events.
#[derive(Clone, Default)]
pub struct BrokerTracker {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl BrokerTracker {
    fn follow(handle: &SchedulerHandle) -> Self {
        let tracker = BrokerTracker::default();
        let ids = Arc::clone(&tracker.ids);
        let mut events = handle.subscribe();

        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SchedulerEvent::BrokerAdded { broker_id, .. } => {
                        ids.lock().unwrap().insert(broker_id);
                    }
                    SchedulerEvent::BrokerRemoved { broker_id, .. } => {
                        ids.lock().unwrap().remove(&broker_id);
                    }
                    SchedulerEvent::AddressesChanged { .. } => {}
                }
            }
        });

        tracker
    }

    pub fn has_exactly(&self, expected: &[&str]) -> bool {
        let ids = self.ids.lock().unwrap();
        ids.len() == expected.len() && expected.iter().all(|id| ids.contains(*id))
    }

    pub async fn wait_for(&self, expected: &[&str]) -> Result<()> {
        wait_until(&format!("brokers {:?}", expected), || self.has_exactly(expected)).await
    }
}

pub async fn wait_until<F>(what: &str, condition: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            bail!("timed out waiting for {}", what);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

pub fn queue(name: &str, plan: &str) -> Address {
    Address::new(name, plan)
}

/// Groups the addresses the same way the address feed does.
pub fn snapshot(addresses: &[Address]) -> AddressSnapshot {
    group_addresses(addresses.iter().cloned())
}
