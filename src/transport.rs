//! TLS transport for the OR connection
//!
//! The link layer consumes a plain byte pipe: non-blocking reads, writes
//! that may accept only part of the buffer, and a flag for when the TLS
//! handshake has finished. `TlsTransport` implements it with rustls over a
//! non-blocking `TcpStream`, driven by reactor readiness.
//!
//! Relay link certificates are self-signed; channel identity is proven by
//! the circuit handshake rather than web PKI, so the connector installs a
//! verifier that accepts any server certificate.

use crate::authorities::Authority;
use crate::error::{Result, TorError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

/// A TLS-wrapped byte pipe the link layer reads and writes.
pub trait Transport {
    /// Non-blocking read into `buf`.
    ///
    /// Returns `Ok(0)` when no bytes are currently available. A closed
    /// peer is a transport error, not a zero-length read.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Non-blocking write; returns how many bytes were accepted, possibly
    /// zero when the write buffer is full.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Whether the TLS handshake is still in progress. The link handshake
    /// must not start before this turns false.
    fn is_handshaking(&self) -> bool;

    /// Whether buffered TLS output is waiting for socket writability.
    fn wants_write(&self) -> bool;

    /// Peer address, when known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Opens transports to directory authorities on demand.
pub trait Connector {
    type Transport: Transport;

    fn connect(&mut self, authority: &Authority) -> Result<Self::Transport>;
}

/// Accepts any server certificate.
///
/// Tor relays present self-signed link certificates; authenticating them
/// against a root store would reject every relay.
#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Opens TLS transports to authorities.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new() -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let schemes = provider
            .signature_verification_algorithms
            .supported_schemes();

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TorError::Transport(format!("TLS config: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { schemes }))
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Connect a TCP socket to the authority and wrap it in TLS.
    ///
    /// The TCP connect is blocking; the socket is switched to non-blocking
    /// before the TLS handshake, which then proceeds under the reactor.
    pub fn connect(&self, authority: &Authority) -> Result<TlsTransport> {
        let addr = authority.socket_addr()?;
        log::info!(
            "connecting to authority {} at {}",
            authority.name,
            addr
        );

        let sock = TcpStream::connect(addr)?;
        sock.set_nodelay(true)?;
        sock.set_nonblocking(true)?;

        let server_name = ServerName::try_from(authority.ip.to_string())
            .map_err(|e| TorError::Transport(format!("bad server name: {}", e)))?;
        let conn = ClientConnection::new(Arc::clone(&self.config), server_name)
            .map_err(|e| TorError::Transport(format!("TLS client: {}", e)))?;

        Ok(TlsTransport {
            sock,
            conn,
            peer: addr,
        })
    }
}

/// TLS over a non-blocking TCP socket.
pub struct TlsTransport {
    sock: TcpStream,
    conn: ClientConnection,
    peer: SocketAddr,
}

impl TlsTransport {
    /// Pump TLS records between the socket and the rustls state machine.
    /// Called from both directions; WouldBlock is not an error.
    fn pump_io(&mut self) -> Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        if self.conn.wants_read() {
            match self.conn.read_tls(&mut self.sock) {
                Ok(0) => return Err(TorError::Transport("peer closed connection".into())),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| TorError::Transport(format!("TLS: {}", e)))?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Transport for TlsTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.pump_io()?;
        match self.conn.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let n = match self.conn.writer().write(data) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };
        self.pump_io()?;
        Ok(n)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

impl AsRawFd for TlsTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl Connector for TlsConnector {
    type Transport = TlsTransport;

    fn connect(&mut self, authority: &Authority) -> Result<TlsTransport> {
        TlsConnector::connect(self, authority)
    }
}
