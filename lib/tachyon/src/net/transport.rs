use crate::net::policy::SecurityOptions;
use crate::net::support::{security_code, Fault};
use lumen::logging;
use mio::event::Source;
use mio::net::TcpStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use std::convert::TryFrom;
use std::io;
use std::io::{Read, Write};
use std::iter::FromIterator;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

/// Proxy endpoint the stream pair is routed through, consumed as given.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProxyDescriptor {
    pub host: String,
    pub port: u16,
}

/// Endpoint description produced by connection preparation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub security: Option<SecurityOptions>,
    pub proxy: Option<ProxyDescriptor>,
}

impl Target {
    /// Host and port the socket actually dials.
    #[inline]
    pub fn endpoint(&self) -> (&str, u16) {
        match &self.proxy {
            Some(proxy) => (&proxy.host, proxy.port),
            None => (&self.host, self.port),
        }
    }
}

/// A full-duplex byte stream backing both halves of a connection.
pub trait Transport: io::Read + io::Write {
    /// Whether the underlying handle has finished establishing. Errors
    /// surfaced here are connect failures.
    fn established(&mut self) -> io::Result<bool>;

    /// Tears down the underlying handle. Must be safe to call at any point
    /// of the lifecycle.
    fn shutdown(&mut self);

    /// Domain-preserving fault recorded by the transport layer for the most
    /// recent I/O error, if any.
    fn take_fault(&mut self) -> Option<Fault> {
        None
    }

    /// Poll registration source when the transport is backed by a real
    /// socket.
    fn source(&mut self) -> Option<&mut dyn Source> {
        None
    }
}

/// Produces transports for prepared targets. The connection owns one
/// connector for its whole lifetime; tests substitute scripted ones.
pub trait Connector {
    fn open(&mut self, target: &Target, log: &logging::Logger) -> Result<Box<dyn Transport>, Fault>;
}

/// Default connector: a non-blocking socket, wrapped in TLS when the target
/// carries a security option set.
pub struct SocketConnector;

impl SocketConnector {
    #[inline]
    pub fn new() -> SocketConnector {
        SocketConnector
    }
}

impl Connector for SocketConnector {
    fn open(&mut self, target: &Target, log: &logging::Logger) -> Result<Box<dyn Transport>, Fault> {
        let (host, port) = target.endpoint();
        let address = resolve(host, port)?;

        logging::debug!(log, "opening stream pair";
                        "context" => "open",
                        "endpoint" => %address,
                        "secure" => target.security.is_some());

        let sock = TcpStream::connect(address).map_err(|err| Fault::posix(&err))?;

        match &target.security {
            Some(options) => Ok(Box::new(TlsTransport::new(sock, &target.host, options)?)),
            None => Ok(Box::new(PlainTransport::new(sock))),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Fault> {
    (host, port)
        .to_socket_addrs()
        .map_err(|err| Fault::setup(format!("Failed to resolve {}:{}: {}", host, port, err)))?
        .next()
        .ok_or_else(|| Fault::setup(format!("No addresses for {}:{}", host, port)))
}

fn socket_established(sock: &TcpStream) -> io::Result<bool> {
    if let Some(err) = sock.take_error()? {
        return Err(err);
    }

    match sock.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(err) => Err(err),
    }
}

/// Cleartext transport.
pub struct PlainTransport {
    sock: TcpStream,
}

impl PlainTransport {
    #[inline]
    pub fn new(sock: TcpStream) -> PlainTransport {
        PlainTransport { sock }
    }
}

impl io::Read for PlainTransport {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.read(buf)
    }
}

impl io::Write for PlainTransport {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.sock.flush()
    }
}

impl Transport for PlainTransport {
    fn established(&mut self) -> io::Result<bool> {
        socket_established(&self.sock)
    }

    fn shutdown(&mut self) {
        drop(self.sock.shutdown(Shutdown::Both));
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        Some(&mut self.sock)
    }
}

/// TLS transport: a rustls client session pumped over the non-blocking
/// socket. The handshake advances inside the regular read and write paths,
/// so handshake failures surface as stream faults on the half that was
/// active.
pub struct TlsTransport {
    session: ClientConnection,
    sock: TcpStream,
    fault: Option<Fault>,
}

impl TlsTransport {
    pub fn new(sock: TcpStream, host: &str, options: &SecurityOptions) -> Result<TlsTransport, Fault> {
        let name = options.peer_name.clone().unwrap_or_else(|| host.to_string());
        let server_name = ServerName::try_from(name)
            .map_err(|err| Fault::setup(format!("Invalid peer name for {}: {}", host, err)))?;

        let session = ClientConnection::new(client_config(options), server_name)
            .map_err(|err| security_fault(&err))?;

        Ok(TlsTransport {
            session,
            sock,
            fault: None,
        })
    }

    /// Ships buffered ciphertext until the socket stops accepting it.
    fn pump_writes(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.sock) {
                Ok(_) => (),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    fn record_fault(&mut self, error: &rustls::Error) -> io::Error {
        self.fault = Some(security_fault(error));

        io::Error::new(io::ErrorKind::InvalidData, error.to_string())
    }
}

impl io::Read for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // Drain plaintext decrypted on a previous pass first.
            match self.session.reader().read(buf) {
                Ok(read) if read > 0 => return Ok(read),
                Ok(_) => return Ok(0),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
                Err(err) => return Err(err),
            }

            // Keep the handshake and post-handshake traffic moving before
            // asking the socket for more ciphertext.
            self.pump_writes()?;

            match self.session.read_tls(&mut self.sock) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    if let Err(error) = self.session.process_new_packets() {
                        // Ship the pending alert before surfacing.
                        drop(self.pump_writes());
                        return Err(self.record_fault(&error));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl io::Write for TlsTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.session.writer().write(buf)?;

        self.pump_writes()?;

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pump_writes()
    }
}

impl Transport for TlsTransport {
    fn established(&mut self) -> io::Result<bool> {
        socket_established(&self.sock)
    }

    fn shutdown(&mut self) {
        self.session.send_close_notify();
        drop(self.pump_writes());
        drop(self.sock.shutdown(Shutdown::Both));
    }

    fn take_fault(&mut self) -> Option<Fault> {
        self.fault.take()
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        Some(&mut self.sock)
    }
}

/// Builds the rustls client configuration matching a security option set.
/// Chain validation maps to the webpki verifier over the bundled roots; the
/// relaxed levels install a verifier that admits any presented chain.
fn client_config(options: &SecurityOptions) -> Arc<ClientConfig> {
    let config = if options.validates_certificate_chain {
        let roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PermissiveVerifier::new()))
            .with_no_client_auth()
    };

    Arc::new(config)
}

/// Certificate verifier for the relaxed validation levels: signatures are
/// still checked, the chain itself is admitted regardless of root, expiry or
/// name.
#[derive(Debug)]
struct PermissiveVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl PermissiveVerifier {
    fn new() -> PermissiveVerifier {
        PermissiveVerifier {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PermissiveVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Wraps a TLS layer error into a security domain fault, preserving a code
/// in the handshake failure range for the escalator to recognize.
fn security_fault(error: &rustls::Error) -> Fault {
    use rustls::CertificateError;

    let code = match error {
        rustls::Error::InvalidCertificate(CertificateError::Expired) => security_code::CERT_EXPIRED,
        rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer) => {
            security_code::UNKNOWN_ROOT
        }
        rustls::Error::InvalidCertificate(_) => security_code::CHAIN_INVALID,
        rustls::Error::AlertReceived(_) => security_code::FATAL_ALERT,
        rustls::Error::PeerIncompatible(_) => security_code::NEGOTIATION_FAILURE,
        _ => security_code::PROTOCOL_FAILURE,
    };

    Fault::security(code, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::policy::{SecurityLevel, SecurityPolicy};
    use rustls::CertificateError;

    #[test]
    fn test_target_endpoint_prefers_proxy() {
        let target = Target {
            host: "origin.example.net".to_string(),
            port: 443,
            security: None,
            proxy: Some(ProxyDescriptor {
                host: "10.0.0.1".to_string(),
                port: 3128,
            }),
        };

        assert_eq!(target.endpoint(), ("10.0.0.1", 3128));
    }

    #[test]
    fn test_target_endpoint_without_proxy() {
        let target = Target {
            host: "origin.example.net".to_string(),
            port: 80,
            security: None,
            proxy: None,
        };

        assert_eq!(target.endpoint(), ("origin.example.net", 80));
    }

    #[test]
    fn test_client_config_builds_for_both_secure_levels() {
        for level in &[SecurityLevel::Strict, SecurityLevel::Lenient] {
            let options = SecurityPolicy::options_for(*level).unwrap();

            client_config(&options);
        }
    }

    #[test]
    fn test_security_fault_codes() {
        let expired =
            security_fault(&rustls::Error::InvalidCertificate(CertificateError::Expired));
        let unknown = security_fault(&rustls::Error::InvalidCertificate(
            CertificateError::UnknownIssuer,
        ));
        let general = security_fault(&rustls::Error::General("negotiation".to_string()));

        assert_eq!(expired.code, security_code::CERT_EXPIRED);
        assert_eq!(unknown.code, security_code::UNKNOWN_ROOT);
        assert_eq!(general.code, security_code::PROTOCOL_FAILURE);
        assert!(expired.is_tls_handshake());
        assert!(unknown.is_tls_handshake());
        assert!(general.is_tls_handshake());
    }

    #[test]
    fn test_resolve_loopback() {
        let address = resolve("127.0.0.1", 8080).unwrap();

        assert_eq!(address.port(), 8080);
        assert!(address.is_ipv4());
    }
}
