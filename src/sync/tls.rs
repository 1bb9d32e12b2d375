//! Optional TLS wrapping for the sync channel.
//!
//! When enabled, sync connections speak TLS 1.2+ using a node-local
//! self-signed certificate (EC P-256, one-year validity, SAN covering the
//! hostname, every non-loopback IPv4, and localhost) generated on first
//! boot and reused thereafter. Client certificates are verified against a
//! shared CA.

use crate::config::TlsSettings;
use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream as ClientTlsStream, server::TlsStream as ServerTlsStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// TLS materials for both sides of the sync channel.
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsContext {
    /// Builds server and client configurations from the settings. The CA
    /// file is required: client verification against a shared CA is part
    /// of the contract when TLS is on.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        // The process-wide provider must be pinned before any config is
        // built; a second install attempt just reports the existing one.
        let _ = rustls::crypto::ring::default_provider().install_default();

        if settings.cert_file.is_empty() || settings.key_file.is_empty() {
            return Err(Error::Tls("cert_file and key_file are required".to_string()));
        }
        if settings.ca_file.is_empty() {
            return Err(Error::Tls(
                "ca_file is required when TLS is enabled".to_string(),
            ));
        }

        let certs = load_certs(Path::new(&settings.cert_file))?;
        let key = load_key(Path::new(&settings.key_file))?;
        let ca_certs = load_certs(Path::new(&settings.ca_file))?;

        let mut roots = RootCertStore::empty();
        for cert in &ca_certs {
            roots
                .add(cert.clone())
                .map_err(|e| Error::Tls(format!("bad CA certificate: {e}")))?;
        }
        let roots = Arc::new(roots);

        let client_verifier = rustls::server::WebPkiClientVerifier::builder(roots.clone())
            .build()
            .map_err(|e| Error::Tls(format!("failed to build client verifier: {e}")))?;

        let server_config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| Error::Tls(format!("bad server certificate: {e}")))?;

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::Tls(format!("bad client certificate: {e}")))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Accepts a server-side handshake.
    pub async fn accept(&self, stream: TcpStream) -> Result<ServerTlsStream<TcpStream>> {
        self.acceptor
            .accept(stream)
            .await
            .map_err(|e| Error::Tls(format!("handshake failed: {e}")))
    }

    /// Performs a client-side handshake against `host`.
    pub async fn connect(&self, host: &str, stream: TcpStream) -> Result<ClientTlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))?;
        self.connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::Tls(format!("handshake failed: {e}")))
    }
}

/// Generates (or reuses) the node's self-signed certificate under
/// `cert_dir`, returning the certificate and key paths.
pub fn generate_node_cert(cert_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(cert_dir)?;
    #[cfg(unix)]
    std::fs::set_permissions(cert_dir, std::fs::Permissions::from_mode(0o700))?;

    let cert_path = cert_dir.join("budgie.crt");
    let key_path = cert_dir.join("budgie.key");

    if cert_path.exists() && key_path.exists() {
        debug!("using existing self-signed certificate");
        return Ok((cert_path, key_path));
    }

    info!("generating self-signed certificate");

    let hostname = crate::bundle::node_id();
    let mut sans: Vec<String> = vec![hostname.clone(), "localhost".to_string()];
    for ip in crate::discovery::local_ipv4_addrs() {
        if !ip.is_loopback() {
            sans.push(ip.to_string());
        }
    }

    let mut params = rcgen::CertificateParams::new(sans)
        .map_err(|e| Error::Tls(format!("bad certificate parameters: {e}")))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, "Budgie");
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, hostname);
    // One year of validity from today.
    use chrono::Datelike;
    let today = chrono::Utc::now();
    let expiry = today + chrono::Duration::days(365);
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

    // P-256, matching the rest of the fleet.
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Tls(format!("failed to generate key: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Tls(format!("failed to self-sign: {e}")))?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    #[cfg(unix)]
    std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;

    info!("generated self-signed certificate at {}", cert_path.display());
    Ok((cert_path, key_path))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Tls(format!("failed to read {}: {e}", path.display())))?;
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut data.as_slice()).collect();
    certs.map_err(|e| Error::Tls(format!("failed to parse {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Tls(format!("failed to read {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| Error::Tls(format!("failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}
