use queue_scheduler_core::{Result, SchedulerError};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub const KEY_FILE: &str = "tls.key";
pub const CERT_FILE: &str = "tls.crt";
pub const CA_FILE: &str = "ca.crt";

/// Builds the acceptor for broker connections from the PEM files found in `dir`.
///
/// The directory must hold the server key (`tls.key`), its certificate chain
/// (`tls.crt`) and the CA bundle (`ca.crt`) used to verify the client
/// certificate every broker has to present.
pub fn load_tls_acceptor(dir: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(&dir.join(CERT_FILE))?;
    let key = load_private_key(&dir.join(KEY_FILE))?;

    let mut roots = RootCertStore::empty();
    for ca in load_certs(&dir.join(CA_FILE))? {
        roots
            .add(ca)
            .map_err(|e| SchedulerError::Tls(format!("invalid CA certificate: {}", e)))?;
    }

    let provider = Arc::new(ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| SchedulerError::Tls(format!("failed to build client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SchedulerError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| SchedulerError::Tls(e.to_string()))?;

    info!(dir = %dir.display(), "loaded TLS material, client certificates required");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| SchedulerError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SchedulerError::Tls(format!("cannot parse {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(SchedulerError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| SchedulerError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    while let Some(item) = rustls_pemfile::read_one(&mut reader)
        .map_err(|e| SchedulerError::Tls(format!("cannot parse {}: {}", path.display(), e)))?
    {
        match item {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(SchedulerError::Tls(format!(
        "no private key found in {}",
        path.display()
    )))
}
