//! Mutually authenticated sessions with per-spawn credentials.
//!
//! Each side generates a fresh self-signed certificate for every plugin
//! session and trusts exactly the certificate its peer presented during the
//! handshake. Nothing is persisted, so a restarted plugin never sees a
//! credential from an earlier session.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rcgen::{CertificateParams, ExtendedKeyUsagePurpose, KeyPair};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use super::conduit::Conduit;
use super::error::TlsError;

/// DNS name embedded in every session certificate.
const SESSION_SUBJECT: &str = "localhost";

/// Certificate and key generated for one session.
#[derive(Clone)]
pub struct SessionIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

impl std::fmt::Debug for SessionIdentity {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionIdentity")
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

impl SessionIdentity {
    /// Generates a fresh self-signed certificate valid for client and server
    /// authentication.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Certificate`] when key or certificate generation
    /// fails.
    pub fn generate() -> Result<Self, TlsError> {
        let certificate_error = |err: rcgen::Error| TlsError::Certificate {
            message: err.to_string(),
        };
        let mut params =
            CertificateParams::new(vec![SESSION_SUBJECT.to_owned()]).map_err(certificate_error)?;
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key_pair = KeyPair::generate().map_err(certificate_error)?;
        let cert = params.self_signed(&key_pair).map_err(certificate_error)?;
        Ok(Self {
            cert_der: cert.der().to_vec(),
            key_der: key_pair.serialize_der(),
        })
    }

    /// Returns the DER certificate.
    #[must_use]
    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Returns the certificate encoded for the environment or handshake line.
    #[must_use]
    pub fn certificate_base64(&self) -> String {
        STANDARD.encode(&self.cert_der)
    }

    fn certificate(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// Decodes a base64 DER certificate received from the peer.
///
/// # Errors
///
/// Returns [`TlsError::Decode`] when the text is not valid base64 or is empty.
pub fn decode_certificate(text: &str) -> Result<Vec<u8>, TlsError> {
    let der = STANDARD
        .decode(text.trim())
        .map_err(|err| TlsError::Decode {
            message: err.to_string(),
        })?;
    if der.is_empty() {
        return Err(TlsError::Decode {
            message: "certificate is empty".to_owned(),
        });
    }
    Ok(der)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn config_error(err: impl std::fmt::Display) -> TlsError {
    TlsError::Config {
        message: err.to_string(),
    }
}

fn trust_only(peer_cert: &[u8]) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(peer_cert.to_vec()))
        .map_err(config_error)?;
    Ok(roots)
}

/// Opens the host (client) side of a session.
///
/// `timeout` bounds each read during the handshake.
///
/// # Errors
///
/// Returns [`TlsError::Config`] for unusable credentials and
/// [`TlsError::Handshake`] when the peer does not complete the handshake.
pub fn connect(
    sock: Box<dyn Conduit>,
    identity: &SessionIdentity,
    server_cert: &[u8],
    timeout: Duration,
) -> Result<TlsConduit, TlsError> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(config_error)?
        .with_root_certificates(trust_only(server_cert)?)
        .with_client_auth_cert(vec![identity.certificate()], identity.private_key())
        .map_err(config_error)?;
    let server_name = ServerName::try_from(SESSION_SUBJECT).map_err(config_error)?;
    let conn = ClientConnection::new(Arc::new(config), server_name).map_err(config_error)?;
    TlsConduit::establish(Connection::Client(conn), sock, timeout)
}

/// Opens the plugin (server) side of a session.
///
/// Only a client presenting exactly `client_cert` is accepted.
///
/// # Errors
///
/// Returns [`TlsError::Config`] for unusable credentials and
/// [`TlsError::Handshake`] when the peer does not complete the handshake.
pub fn accept(
    sock: Box<dyn Conduit>,
    identity: &SessionIdentity,
    client_cert: &[u8],
    timeout: Duration,
) -> Result<TlsConduit, TlsError> {
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(trust_only(client_cert)?), provider())
            .build()
            .map_err(config_error)?;
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(config_error)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![identity.certificate()], identity.private_key())
        .map_err(config_error)?;
    let conn = ServerConnection::new(Arc::new(config)).map_err(config_error)?;
    TlsConduit::establish(Connection::Server(conn), sock, timeout)
}

/// A [`Conduit`] that encrypts everything written to the inner stream.
pub struct TlsConduit {
    conn: Connection,
    sock: Box<dyn Conduit>,
}

impl TlsConduit {
    fn establish(
        conn: Connection,
        mut sock: Box<dyn Conduit>,
        timeout: Duration,
    ) -> Result<Self, TlsError> {
        let handshake_error = |err: io::Error| TlsError::Handshake {
            source: Arc::new(err),
        };
        sock.set_poll_interval(Some(timeout))
            .map_err(handshake_error)?;
        let mut conduit = Self { conn, sock };
        while conduit.conn.is_handshaking() {
            conduit
                .conn
                .complete_io(&mut conduit.sock)
                .map_err(handshake_error)?;
        }
        conduit.flush_tls().map_err(handshake_error)?;
        Ok(conduit)
    }

    fn flush_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.sock)?;
        }
        self.sock.flush()
    }
}

impl Read for TlsConduit {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(read) => return Ok(read),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
            // A poll timeout in read_tls propagates to the caller untouched;
            // any partial record stays buffered inside the connection.
            if self.conn.read_tls(&mut self.sock)? == 0 {
                return Ok(0);
            }
            self.conn
                .process_new_packets()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            self.flush_tls()?;
        }
    }
}

impl Write for TlsConduit {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.conn.writer().write(buf)?;
        self.flush_tls()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.writer().flush()?;
        self.flush_tls()
    }
}

impl Conduit for TlsConduit {
    fn set_poll_interval(&mut self, interval: Option<Duration>) -> io::Result<()> {
        self.sock.set_poll_interval(interval)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        let flushed = self.flush_tls();
        let closed = self.sock.shutdown();
        flushed.and(closed)
    }
}
