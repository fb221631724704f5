//! Tunnel bridging and hand-off to the internal TLS server loop.

use std::io;
use std::path::Path;
use std::sync::Arc;

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::error::CompyError;
use crate::mitm::{CertFaker, MitmConn};

/// A client connection hijacked from a CONNECT request.
pub type HijackedIo = TokioIo<Upgraded>;

/// Decrypted client side of an intercepted tunnel.
pub type TunnelStream = tokio_rustls::server::TlsStream<MitmConn<HijackedIo>>;

/// Bridges hijacked tunnels: dials the origin over TLS, forges a
/// certificate for the client handshake and hands the decrypted stream
/// to the internal server loop through a bounded channel.
pub struct MitmListener {
    tx: mpsc::Sender<TunnelStream>,
    faker: CertFaker,
    connector: TlsConnector,
}

/// Receiving end of the tunnel hand-off, consumed by the internal
/// server loop.
pub struct MitmAccept {
    rx: mpsc::Receiver<TunnelStream>,
}

impl MitmAccept {
    pub async fn accept(&mut self) -> Option<TunnelStream> {
        self.rx.recv().await
    }
}

impl MitmListener {
    /// `roots` is the trust store for dialing origins; callers add the
    /// operator CA to it so origins behind the same CA (chained proxies,
    /// internal services) validate.
    pub fn new(
        ca_cert: &Path,
        ca_key: &Path,
        roots: RootCertStore,
    ) -> Result<(Self, MitmAccept), CompyError> {
        let faker = CertFaker::new(ca_cert, ca_key)?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        // Capacity one keeps the hand-off synchronous with the server
        // loop, the same back-pressure a listening socket would give.
        let (tx, rx) = mpsc::channel(1);
        Ok((Self { tx, faker, connector }, MitmAccept { rx }))
    }

    /// Connects to `authority` ("host:port") over TLS, forges a leaf
    /// certificate mirroring the origin's and completes the TLS
    /// handshake with the hijacked client. The upstream session is only
    /// used to obtain the origin certificate and is torn down here;
    /// forwarded requests open their own connections.
    pub async fn bridge(
        &self,
        authority: &str,
        conn: MitmConn<HijackedIo>,
    ) -> Result<(), CompyError> {
        let host = authority
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(authority);

        let tcp = TcpStream::connect(authority).await?;
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| CompyError::Address(format!("invalid tls server name: {host}")))?;
        let upstream = self.connector.connect(server_name, tcp).await?;

        let origin = upstream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first());
        let (cert, key) = self.faker.fake_cert(origin, host)?;
        drop(upstream);

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let stream = acceptor.accept(conn).await?;
        debug!(authority, "tunnel established");

        self.tx
            .send(stream)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tunnel server stopped"))?;
        Ok(())
    }
}
