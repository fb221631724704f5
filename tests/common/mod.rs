//! Shared utilities for integration testing: a mock origin served over
//! TCP or TLS, a throwaway CA and proxy bootstrap helpers.

#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use compy::proxy::{Proxy, Stats};
use compy::transcode::{Gif, Identity, Jpeg, Png, Zip};

pub const TEXT_BODY: &[u8] = b"The quick brown fox jumps over the lazy dog.\n";

pub fn html_body() -> Vec<u8> {
    let mut page = String::from("<html><body>");
    for _ in 0..64 {
        page.push_str("<p>some compressible paragraph text</p>");
    }
    page.push_str("</body></html>");
    page.into_bytes()
}

pub fn jpeg_body() -> Vec<u8> {
    let img = test_image();
    let mut out = Vec::new();
    img.to_rgb8()
        .write_with_encoder(image::codecs::jpeg::JpegEncoder::new_with_quality(
            &mut out, 90,
        ))
        .unwrap();
    out
}

pub fn png_body() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    test_image().write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn gif_body() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    test_image().write_to(&mut out, image::ImageFormat::Gif).unwrap();
    out.into_inner()
}

pub fn gzipped_html() -> Vec<u8> {
    use std::io::Write;
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(&html_body()).unwrap();
    enc.finish().unwrap()
}

fn test_image() -> image::DynamicImage {
    let img = image::RgbaImage::from_fn(64, 64, |x, y| {
        image::Rgba([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8, 255])
    });
    image::DynamicImage::ImageRgba8(img)
}

/// Throwaway certificate authority backing TLS origins and the proxy's
/// interception CA. The PEM files live in the temp directory for the
/// duration of the test.
pub struct TestCa {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_pem: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(tag: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "compy test ca");
        let cert = params.self_signed(&key).unwrap();

        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("compy-test-ca-{tag}-{}.crt", std::process::id()));
        let key_path = dir.join(format!("compy-test-ca-{tag}-{}.key", std::process::id()));
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        Self {
            cert_pem: cert.pem(),
            cert_path,
            key_path,
            cert,
            key,
        }
    }

    /// Issues a server certificate for `host`, signed by this CA.
    pub fn issue(&self, host: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let leaf_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![host.to_owned()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, host);
        let leaf = params.signed_by(&leaf_key, &self.cert, &self.key).unwrap();
        (
            leaf.der().clone(),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        )
    }
}

/// Start a mock origin serving fixed bodies by path.
pub async fn start_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    tokio::spawn(serve_origin(socket));
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Same origin behind TLS, presenting a certificate for `host` issued
/// by `ca`.
pub async fn start_tls_origin(ca: &TestCa, host: &str) -> SocketAddr {
    let (cert, key) = ca.issue(host);
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Ok(tls) = acceptor.accept(socket).await {
                            serve_origin(tls).await;
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

async fn serve_origin<S>(mut socket: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    let mut request_body = data[head_end..].to_vec();
    while request_body.len() < content_length {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        request_body.extend_from_slice(&buf[..n]);
    }

    let (status, content_type, encoding, body) = match path.as_str() {
        "/text" => ("200 OK", "text/plain", None, TEXT_BODY.to_vec()),
        "/html" => ("200 OK", "text/html; charset=utf-8", None, html_body()),
        "/gzipped" => ("200 OK", "text/html", Some("gzip"), gzipped_html()),
        "/echo" => ("200 OK", "application/octet-stream", None, request_body),
        "/image/jpeg" => ("200 OK", "image/jpeg", None, jpeg_body()),
        "/image/png" => ("200 OK", "image/png", None, png_body()),
        "/image/gif" => ("200 OK", "image/gif", None, gif_body()),
        "/image/broken" => ("200 OK", "image/png", None, b"not a png at all".to_vec()),
        _ => ("404 Not Found", "text/plain", None, b"not found".to_vec()),
    };

    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    if let Some(encoding) = encoding {
        response.push_str(&format!("Content-Encoding: {encoding}\r\n"));
    }
    response.push_str("\r\n");
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.write_all(&body).await;
    let _ = socket.shutdown().await;
}

/// Register the default transcoder set used by most tests.
pub fn register_defaults(proxy: &mut Proxy) {
    proxy.add_transcoder("image/jpeg", Arc::new(Jpeg::new(50)));
    proxy.add_transcoder("image/gif", Arc::new(Gif));
    proxy.add_transcoder("image/png", Arc::new(Png));
    proxy.add_transcoder("text/html", Arc::new(Zip::new(Arc::new(Identity), 6, 6, true)));
}

/// Start a proxy on an ephemeral port and return its address.
pub async fn start_proxy(configure: impl FnOnce(&mut Proxy)) -> SocketAddr {
    launch(None, None, configure).await.0
}

/// Same as [`start_proxy`] with a certificate published at `/cacert`.
pub async fn start_proxy_with_cert(
    public_cert: Option<PathBuf>,
    configure: impl FnOnce(&mut Proxy),
) -> SocketAddr {
    launch(public_cert, None, configure).await.0
}

/// Same as [`start_proxy`], also handing back the traffic counters.
pub async fn start_proxy_with_stats(
    configure: impl FnOnce(&mut Proxy),
) -> (SocketAddr, Arc<Stats>) {
    launch(None, None, configure).await
}

/// Start a proxy with CONNECT interception backed by `ca`.
pub async fn start_proxy_with_mitm(
    ca: &TestCa,
    configure: impl FnOnce(&mut Proxy),
) -> SocketAddr {
    launch(None, Some(ca), configure).await.0
}

async fn launch(
    public_cert: Option<PathBuf>,
    mitm: Option<&TestCa>,
    configure: impl FnOnce(&mut Proxy),
) -> (SocketAddr, Arc<Stats>) {
    // Grab a free port, then hand it to the proxy.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let mut proxy = Proxy::new(addr.to_string(), public_cert);
    if let Some(ca) = mitm {
        proxy.enable_mitm(&ca.cert_path, &ca.key_path).unwrap();
    }
    configure(&mut proxy);
    let stats = proxy.stats();
    tokio::spawn(async move {
        let _ = proxy.start(addr).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, stats)
}

/// A reqwest client routed through the proxy under test.
pub fn proxied_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap()
}

/// A reqwest client that tunnels https through the proxy and trusts
/// `ca` for the forged certificates it will be shown.
pub fn tunneling_client(proxy_addr: SocketAddr, ca: &TestCa) -> reqwest::Client {
    reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(reqwest::Certificate::from_pem(ca.cert_pem.as_bytes()).unwrap())
        .proxy(reqwest::Proxy::https(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap()
}
