//! Per-request dispatch: authentication, CONNECT interception, the
//! admin surface and forwarding with response transcoding.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_TYPE, HOST, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, warn};

use crate::error::CompyError;
use crate::mitm::MitmConn;
use crate::proxy::response::{
    ChannelWriter, CountingReader, CountingWriter, ResponseReader, ResponseWriter,
};
use crate::proxy::{admin, Proxy};

pub(crate) type CompyBody = BoxBody<Bytes, io::Error>;

pub(crate) fn full(data: impl Into<Bytes>) -> CompyBody {
    Full::new(data.into()).map_err(io::Error::other).boxed()
}

pub(crate) fn empty() -> CompyBody {
    Empty::new().map_err(io::Error::other).boxed()
}

pub(crate) fn status_response(status: StatusCode) -> Response<CompyBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = status;
    resp
}

pub(crate) async fn handle(
    proxy: Arc<Proxy>,
    mut req: Request<Incoming>,
    via_tls: bool,
) -> Response<CompyBody> {
    if let Some((user, pass)) = &proxy.auth {
        if !authorized(req.headers(), user, pass) {
            return proxy_auth_required();
        }
        req.headers_mut().remove(PROXY_AUTHORIZATION);
    }

    if req.method() == Method::CONNECT {
        return connect(proxy, req).await;
    }
    debug!(method = %req.method(), uri = %req.uri(), "serving request");

    // The client's full header set is kept for the transcoders; the
    // forwarded Accept-Encoding is reduced to the encodings this proxy
    // can undo, so the origin never sends anything else.
    let client_headers = req.headers().clone();
    if let Some(value) = client_headers
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
    {
        match HeaderValue::from_str(&supported_encodings(value)) {
            Ok(v) if !v.is_empty() => {
                req.headers_mut().insert(ACCEPT_ENCODING, v);
            }
            _ => {
                req.headers_mut().remove(ACCEPT_ENCODING);
            }
        }
    }

    let Some(target) = request_target(&req) else {
        debug!("request names no target host");
        return status_response(StatusCode::BAD_REQUEST);
    };
    if target == proxy.host {
        return admin::handle(&proxy, req).await;
    }

    let resp = match forward(&proxy, req, via_tls).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "forwarding failed");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    transcode_response(proxy, resp, client_headers).await
}

fn authorized(headers: &HeaderMap, user: &str, pass: &str) -> bool {
    let expected = BASE64.encode(format!("{user}:{pass}"));
    headers
        .get(PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .map(|token| token.trim() == expected)
        .unwrap_or(false)
}

/// Keeps only the encoding tokens the transcoder pipeline understands.
fn supported_encodings(value: &str) -> String {
    value
        .split(',')
        .filter_map(|part| {
            let enc = part.split(';').next().unwrap_or("").trim();
            (enc == "br" || enc == "gzip").then_some(enc)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn proxy_auth_required() -> Response<CompyBody> {
    let mut resp = status_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    resp.headers_mut().insert(
        PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Compy\""),
    );
    resp
}

/// Answers a CONNECT request. With MITM enabled the connection is
/// hijacked after the 200 response and bridged into the tunnel server;
/// without it the tunnel is refused outright.
async fn connect(proxy: Arc<Proxy>, req: Request<Incoming>) -> Response<CompyBody> {
    if proxy.mitm.is_none() {
        warn!("CONNECT received but mitm is not enabled");
        return status_response(StatusCode::BAD_GATEWAY);
    }
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(u) => u,
            Err(e) => {
                debug!(error = %e, "connect upgrade failed");
                return;
            }
        };
        let (conn, closed) = MitmConn::new(TokioIo::new(upgraded));
        let Some(mitm) = &proxy.mitm else { return };
        if let Err(e) = mitm.listener.bridge(&authority, conn).await {
            warn!(%authority, error = %e, "tunnel setup failed");
            return;
        }
        // The hijacked connection must outlive the tunnel it carries.
        closed.wait().await;
        debug!(%authority, "tunnel closed");
    });
    status_response(StatusCode::OK)
}

/// The host the request is aimed at, from the request target or the
/// Host header. A request naming neither is unanswerable.
fn request_target<B>(req: &Request<B>) -> Option<String> {
    req.uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })
}

/// Drop headers that describe the current hop rather than the
/// end-to-end exchange (RFC 9110 section 7.6.1).
fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in [
        CONNECTION,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

fn absolute_uri(parts: &Parts, via_tls: bool) -> Result<Uri, CompyError> {
    let uri = &parts.uri;
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }
    let scheme = if via_tls { "https" } else { "http" };
    let authority = uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })
        .ok_or_else(|| CompyError::Address("request has no host".into()))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Ok(Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()?)
}

async fn forward(
    proxy: &Proxy,
    req: Request<Incoming>,
    via_tls: bool,
) -> Result<Response<Incoming>, CompyError> {
    let (mut parts, body) = req.into_parts();
    let uri = absolute_uri(&parts, via_tls)?;
    parts.uri = uri;
    strip_hop_headers(&mut parts.headers);

    // The inbound body streams through untouched.
    Ok(proxy
        .client
        .request(Request::from_parts(parts, body))
        .await?)
}

/// Runs the origin response through the transcoder registry on the
/// blocking pool and streams the result to the client. The response
/// head is withheld until the pipeline commits it, so transcoders may
/// still rewrite headers after inspecting the body.
async fn transcode_response(
    proxy: Arc<Proxy>,
    resp: Response<Incoming>,
    client_headers: HeaderMap,
) -> Response<CompyBody> {
    let (parts, body) = resp.into_parts();
    let mut headers = parts.headers;
    strip_hop_headers(&mut headers);

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let transcoder = proxy.transcoders.get(&content_type).cloned();

    let read_count = Arc::new(AtomicU64::new(0));
    let write_count = Arc::new(AtomicU64::new(0));
    let (body_tx, body_rx) = mpsc::channel::<Bytes>(1);
    let (commit_tx, commit_rx) = oneshot::channel();

    // The bridge must be built on the runtime; it carries the stream's
    // waker registration into the blocking pool.
    let data = body.into_data_stream().map_err(io::Error::other);
    let bridge = SyncIoBridge::new(StreamReader::new(data));
    let source = CountingReader::new(Box::new(bridge), Arc::clone(&read_count));

    let status = parts.status;
    let writes = Arc::clone(&write_count);
    let pipeline = tokio::task::spawn_blocking(move || {
        let mut r = ResponseReader::new(Box::new(source), status, headers);
        let sink = CountingWriter::new(Box::new(ChannelWriter::new(body_tx)), writes);
        let mut w = ResponseWriter::new(Box::new(sink), Some(commit_tx));
        w.take_headers(&r);
        match &transcoder {
            Some(t) => {
                w.set_chunked();
                t.transcode(&mut w, &mut r, &client_headers)
            }
            None => w.read_from(&mut r).map_err(CompyError::from),
        }
    });

    let stats = Arc::clone(&proxy.stats);
    tokio::spawn(async move {
        // Bytes count whether or not the pipeline succeeded; a failed
        // transcode still moved traffic.
        let result = pipeline.await;
        let read = read_count.load(Ordering::Relaxed);
        let written = write_count.load(Ordering::Relaxed);
        stats.add(read, written);
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "transcoding failed"),
            Err(e) => warn!(error = %e, "transcoding task aborted"),
        }
        let pct = if read > 0 {
            written as f64 / read as f64 * 100.0
        } else {
            100.0
        };
        debug!("transcoded: {read} -> {written} ({pct:3.1}%)");
    });

    match commit_rx.await {
        Ok((status, headers)) => {
            let body = BodyExt::boxed(StreamBody::new(
                ReceiverStream::new(body_rx).map(|b| Ok::<_, io::Error>(Frame::data(b))),
            ));
            let mut resp = Response::new(body);
            *resp.status_mut() = status;
            *resp.headers_mut() = headers;
            resp
        }
        Err(_) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
