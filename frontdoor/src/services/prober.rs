use crate::resilience::retry::with_timeout;
use async_trait::async_trait;
use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use tracing::debug;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PLAINTEXT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const OP_QUERY: i32 = 2004;
const OP_REPLY: i32 = 1;
const MAX_REPLY_LENGTH: usize = 16 * 1024 * 1024;
const REPLY_HEADER_LENGTH: usize = 36;

/// How a backend answers on its MongoDB port, which decides whether its L4
/// router passes TLS through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum TlsPosture {
    /// The backend answered a plaintext handshake; terminate TLS in front of it.
    Plaintext,

    /// The backend only accepts TLS; pass the session through untouched.
    TlsRequired,

    /// The backend accepted TCP but neither handshake concluded cleanly.
    /// Treated as TLS-required, the safer default.
    Ambiguous,

    Unreachable,
}

impl TlsPosture {
    /// Whether the agent's router should be written with TLS passthrough.
    pub fn wants_passthrough(&self) -> bool {
        !matches!(self, Self::Plaintext)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionProber: Send + Sync {
    /// Classify the TLS posture of `host:port`. Has no side effects beyond
    /// the probe sockets.
    async fn classify(&self, host: String, port: u16) -> TlsPosture;
}

pub struct MongoProber {
    tls_config: Arc<ClientConfig>,
}

impl MongoProber {
    pub fn new() -> anyhow::Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
            .with_no_client_auth();
        Ok(Self { tls_config: Arc::new(tls_config) })
    }

    async fn try_plaintext_handshake(&self, host: &str, port: u16) -> Result<bool, std::io::Error> {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(&is_master_query(1)).await?;

        let mut length_prefix = [0u8; 4];
        stream.read_exact(&mut length_prefix).await?;
        let message_length = i32::from_le_bytes(length_prefix) as usize;
        if !(REPLY_HEADER_LENGTH..=MAX_REPLY_LENGTH).contains(&message_length) {
            return Ok(false);
        }
        let mut reply = vec![0u8; message_length];
        reply[..4].copy_from_slice(&length_prefix);
        stream.read_exact(&mut reply[4..]).await?;
        Ok(is_valid_reply(&reply))
    }

    async fn try_tls_handshake(&self, host: &str, port: u16) -> bool {
        let Ok(server_name) = ServerName::try_from(host.to_string()) else {
            return false;
        };
        let Ok(stream) = TcpStream::connect((host, port)).await else {
            return false;
        };
        let connector = TlsConnector::from(self.tls_config.clone());
        connector.connect(server_name, stream).await.is_ok()
    }
}

#[async_trait]
impl ConnectionProber for MongoProber {
    async fn classify(&self, host: String, port: u16) -> TlsPosture {
        // Step 1: is anything listening at all?
        match with_timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("TCP connect to {host}:{port} failed: {e}");
                return TlsPosture::Unreachable;
            }
            Err(_) => {
                debug!("TCP connect to {host}:{port} timed out");
                return TlsPosture::Unreachable;
            }
        }

        // Step 2: speculative plaintext handshake. A structurally valid reply
        // settles the classification.
        match with_timeout(PLAINTEXT_REPLY_TIMEOUT, self.try_plaintext_handshake(&host, port)).await {
            Ok(Ok(true)) => return TlsPosture::Plaintext,
            Ok(Ok(false)) => debug!("{host}:{port} replied with an invalid plaintext handshake"),
            Ok(Err(e)) => debug!("Plaintext handshake with {host}:{port} failed: {e}"),
            Err(_) => debug!("Plaintext handshake with {host}:{port} timed out"),
        }

        // Step 3: can we at least complete a TLS handshake?
        match with_timeout(TLS_HANDSHAKE_TIMEOUT, self.try_tls_handshake(&host, port)).await {
            Ok(true) => TlsPosture::TlsRequired,
            _ => TlsPosture::Ambiguous,
        }
    }
}

/// A legacy `isMaster` query against `admin.$cmd`, the cheapest request every
/// MongoDB version answers in plaintext mode.
fn is_master_query(request_id: i32) -> Vec<u8> {
    let mut document = Vec::new();
    document.extend((0i32).to_le_bytes()); // length, patched below
    document.push(0x10); // int32 element
    document.extend(b"isMaster\0");
    document.extend((1i32).to_le_bytes());
    document.push(0x00);
    let document_length = document.len() as i32;
    document[..4].copy_from_slice(&document_length.to_le_bytes());

    let mut body = Vec::new();
    body.extend((0i32).to_le_bytes()); // flags
    body.extend(b"admin.$cmd\0");
    body.extend((0i32).to_le_bytes()); // numberToSkip
    body.extend((1i32).to_le_bytes()); // numberToReturn
    body.extend(&document);

    let mut message = Vec::new();
    let total_length = (16 + body.len()) as i32;
    message.extend(total_length.to_le_bytes());
    message.extend(request_id.to_le_bytes());
    message.extend((0i32).to_le_bytes()); // responseTo
    message.extend(OP_QUERY.to_le_bytes());
    message.extend(&body);
    message
}

/// A reply is structurally valid when the header parses as OP_REPLY, at least
/// one document came back, and the first document's BSON length fits inside
/// the message.
fn is_valid_reply(reply: &[u8]) -> bool {
    if reply.len() < REPLY_HEADER_LENGTH {
        return false;
    }
    let read_i32 = |offset: usize| i32::from_le_bytes(reply[offset..offset + 4].try_into().expect("bounds checked"));
    let message_length = read_i32(0) as usize;
    if message_length != reply.len() {
        return false;
    }
    if read_i32(12) != OP_REPLY {
        return false;
    }
    let number_returned = read_i32(32);
    if number_returned < 1 {
        return false;
    }
    if reply.len() < REPLY_HEADER_LENGTH + 5 {
        return false;
    }
    let document_length = read_i32(REPLY_HEADER_LENGTH) as usize;
    document_length >= 5 && REPLY_HEADER_LENGTH + document_length <= message_length
}

#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::net::TcpListener;

    fn valid_reply(request_id: i32) -> Vec<u8> {
        // Minimal BSON document {"ismaster": true}
        let mut document = Vec::new();
        document.extend((0i32).to_le_bytes());
        document.push(0x08); // boolean element
        document.extend(b"ismaster\0");
        document.push(0x01);
        document.push(0x00);
        let document_length = document.len() as i32;
        document[..4].copy_from_slice(&document_length.to_le_bytes());

        let mut reply = Vec::new();
        let total = (REPLY_HEADER_LENGTH + document.len()) as i32;
        reply.extend(total.to_le_bytes());
        reply.extend((99i32).to_le_bytes()); // requestID
        reply.extend(request_id.to_le_bytes()); // responseTo
        reply.extend(OP_REPLY.to_le_bytes());
        reply.extend((0i32).to_le_bytes()); // responseFlags
        reply.extend((0i64).to_le_bytes()); // cursorId
        reply.extend((0i32).to_le_bytes()); // startingFrom
        reply.extend((1i32).to_le_bytes()); // numberReturned
        reply.extend(&document);
        reply
    }

    #[test]
    fn query_wire_shape() {
        let query = is_master_query(7);
        assert_eq!(i32::from_le_bytes(query[..4].try_into().unwrap()) as usize, query.len());
        assert_eq!(i32::from_le_bytes(query[4..8].try_into().unwrap()), 7);
        assert_eq!(i32::from_le_bytes(query[12..16].try_into().unwrap()), OP_QUERY);
        let collection = &query[20..31];
        assert_eq!(collection, b"admin.$cmd\0");
    }

    #[test]
    fn valid_reply_is_accepted() {
        assert!(is_valid_reply(&valid_reply(1)));
    }

    #[rstest]
    #[case::empty(Vec::new())]
    #[case::truncated(valid_reply(1)[..20].to_vec())]
    #[case::http(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n".to_vec())]
    #[case::tls_alert(vec![0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x46])]
    fn invalid_replies_are_rejected(#[case] reply: Vec<u8>) {
        assert!(!is_valid_reply(&reply));
    }

    #[test]
    fn reply_with_wrong_opcode_is_rejected() {
        let mut reply = valid_reply(1);
        reply[12..16].copy_from_slice(&(2013i32).to_le_bytes());
        assert!(!is_valid_reply(&reply));
    }

    #[test]
    fn reply_with_no_documents_is_rejected() {
        let mut reply = valid_reply(1);
        reply[32..36].copy_from_slice(&(0i32).to_le_bytes());
        assert!(!is_valid_reply(&reply));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let port = listener.local_addr().expect("no local addr").port();
        drop(listener);

        let prober = MongoProber::new().expect("failed to build prober");
        assert_eq!(prober.classify("127.0.0.1".into(), port).await, TlsPosture::Unreachable);
    }

    #[tokio::test]
    async fn plaintext_backend_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let port = listener.local_addr().expect("no local addr").port();
        tokio::spawn(async move {
            // Serve both probe connections: the reachability check and the handshake.
            for _ in 0..2 {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut request = vec![0u8; 1024];
                    let Ok(n) = socket.read(&mut request).await else { return };
                    if n == 0 {
                        return;
                    }
                    let request_id = i32::from_le_bytes(request[4..8].try_into().unwrap());
                    let _ = socket.write_all(&valid_reply(request_id)).await;
                });
            }
        });

        let prober = MongoProber::new().expect("failed to build prober");
        assert_eq!(prober.classify("127.0.0.1".into(), port).await, TlsPosture::Plaintext);
    }

    #[tokio::test]
    async fn silent_backend_is_ambiguous() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let port = listener.local_addr().expect("no local addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                // Accept and say nothing; drop after a while.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(socket);
                });
            }
        });

        let prober = MongoProber::new().expect("failed to build prober");
        assert_eq!(prober.classify("127.0.0.1".into(), port).await, TlsPosture::Ambiguous);
    }

    #[test]
    fn passthrough_defaults_are_safe() {
        assert!(!TlsPosture::Plaintext.wants_passthrough());
        assert!(TlsPosture::TlsRequired.wants_passthrough());
        assert!(TlsPosture::Ambiguous.wants_passthrough());
        assert!(TlsPosture::Unreachable.wants_passthrough());
    }
}
