//! Proxy core: listeners, per-connection dispatch and shared state.
//!
//! # Responsibilities
//! - Own the transcoder registry, outbound HTTP client, optional MITM
//!   state, authentication and traffic counters.
//! - Accept plaintext or TLS client connections and serve each with the
//!   shared request handler ([`handler`]).
//! - Run the internal server loop that picks up decrypted MITM tunnels
//!   and feeds them through the same handler.

mod admin;
mod handler;
pub mod response;

use std::collections::HashMap;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::error::CompyError;
use crate::mitm::{MitmAccept, MitmListener};
use crate::transcode::Transcoder;

// Request bodies stream straight through to the origin.
type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Incoming>;

fn default_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn build_client(roots: RootCertStore) -> HttpClient {
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder(TokioExecutor::new()).build(https)
}

/// Process-wide traffic counters, origin bytes in and client bytes out.
#[derive(Default)]
pub struct Stats {
    read: AtomicU64,
    written: AtomicU64,
}

impl Stats {
    pub fn add(&self, read: u64, written: u64) {
        self.read.fetch_add(read, Ordering::Relaxed);
        self.written.fetch_add(written, Ordering::Relaxed);
    }

    pub fn read_total(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn written_total(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

struct MitmState {
    listener: MitmListener,
    accept: Mutex<Option<MitmAccept>>,
}

/// Forward proxy with on-the-fly response transcoding.
pub struct Proxy {
    transcoders: HashMap<String, Arc<dyn Transcoder>>,
    mitm: Option<MitmState>,
    auth: Option<(String, String)>,
    host: String,
    public_cert: Option<PathBuf>,
    stats: Arc<Stats>,
    client: HttpClient,
}

impl Proxy {
    /// `host` is the advertised self address used to recognize requests
    /// aimed at the proxy itself. `public_cert` is served at `/cacert`.
    pub fn new(host: String, public_cert: Option<PathBuf>) -> Self {
        Self {
            transcoders: HashMap::new(),
            mitm: None,
            auth: None,
            host,
            public_cert,
            stats: Arc::new(Stats::default()),
            client: build_client(default_roots()),
        }
    }

    /// Registers `t` for responses whose media type equals `content_type`.
    pub fn add_transcoder(&mut self, content_type: &str, t: Arc<dyn Transcoder>) {
        self.transcoders.insert(content_type.to_owned(), t);
    }

    /// Requires proxy authentication. Empty credentials disable it.
    pub fn set_authentication(&mut self, user: &str, pass: &str) {
        if user.is_empty() && pass.is_empty() {
            self.auth = None;
        } else {
            self.auth = Some((user.to_owned(), pass.to_owned()));
        }
    }

    /// Enables CONNECT interception with the given CA material. The CA
    /// is also added to the outbound trust store, so origins whose
    /// certificates chain to it are accepted upstream.
    pub fn enable_mitm(&mut self, ca_cert: &Path, ca_key: &Path) -> Result<(), CompyError> {
        let mut roots = default_roots();
        let ca_file = File::open(ca_cert).map_err(|source| CompyError::ReadFile {
            path: ca_cert.to_path_buf(),
            source,
        })?;
        for cert in rustls_pemfile::certs(&mut BufReader::new(ca_file)) {
            roots.add(cert?)?;
        }
        self.client = build_client(roots.clone());

        let (listener, accept) = MitmListener::new(ca_cert, ca_key, roots)?;
        self.mitm = Some(MitmState {
            listener,
            accept: Mutex::new(Some(accept)),
        });
        Ok(())
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Serves plaintext proxy connections on `addr` until the listener fails.
    pub async fn start(self, addr: SocketAddr) -> Result<(), CompyError> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "proxy listening");
        let proxy = Arc::new(self);
        proxy.spawn_tunnel_loop();
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "client connected");
            let proxy = Arc::clone(&proxy);
            tokio::spawn(proxy.serve_stream(stream, false));
        }
    }

    /// Serves TLS proxy connections on `addr` with the given certificate.
    pub async fn start_tls(
        self,
        addr: SocketAddr,
        cert: &Path,
        key: &Path,
    ) -> Result<(), CompyError> {
        let acceptor = TlsAcceptor::from(load_server_config(cert, key)?);
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "proxy listening (tls)");
        let proxy = Arc::new(self);
        proxy.spawn_tunnel_loop();
        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => proxy.serve_stream(tls, true).await,
                    Err(e) => debug!(%peer, error = %e, "client handshake failed"),
                }
            });
        }
    }

    /// Consumes the MITM hand-off receiver and serves decrypted tunnels
    /// through the shared handler.
    fn spawn_tunnel_loop(self: &Arc<Self>) {
        let Some(mitm) = &self.mitm else { return };
        let Some(mut accept) = mitm.accept.lock().ok().and_then(|mut a| a.take()) else {
            return;
        };
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(tunnel) = accept.accept().await {
                let proxy = Arc::clone(&proxy);
                tokio::spawn(proxy.serve_stream(tunnel, true));
            }
        });
    }

    async fn serve_stream<I>(self: Arc<Self>, io: I, via_tls: bool)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req| {
            let proxy = Arc::clone(&self);
            async move { Ok::<_, Infallible>(handler::handle(proxy, req, via_tls).await) }
        });
        let conn = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        if let Err(e) = conn.await {
            debug!(error = %e, "connection ended with error");
        }
    }
}

fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, CompyError> {
    let open = |path: &Path| {
        File::open(path).map_err(|source| CompyError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
    };
    let certs = rustls_pemfile::certs(&mut BufReader::new(open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(open(key_path)?))?
        .ok_or_else(|| CompyError::Config(format!("no private key in {}", key_path.display())))?;
    if certs.is_empty() {
        return Err(CompyError::Config(format!(
            "no certificate in {}",
            cert_path.display()
        )));
    }
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}
