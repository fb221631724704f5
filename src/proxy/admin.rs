//! Self-addressed requests: the status page and CA certificate download.

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use tracing::debug;

use crate::proxy::handler::{full, status_response, CompyBody};
use crate::proxy::Proxy;

pub(crate) async fn handle(proxy: &Proxy, req: Request<Incoming>) -> Response<CompyBody> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => status_page(proxy),
        (&Method::GET, "/cacert") => cacert(proxy).await,
        _ => status_response(StatusCode::NOT_IMPLEMENTED),
    }
}

fn status_page(proxy: &Proxy) -> Response<CompyBody> {
    let read = proxy.stats.read_total();
    let written = proxy.stats.written_total();
    let saved = if read > 0 {
        100.0 - (written as f64 / read as f64 * 100.0)
    } else {
        0.0
    };
    let page = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>compy</title></head>\n<body>\n\
         <h1>compy</h1>\n\
         <p>transferred {read} bytes in, {written} bytes out ({saved:.1}% saved)</p>\n\
         <p><a href=\"/cacert\">CA certificate</a></p>\n\
         </body>\n</html>\n"
    );
    let mut resp = Response::new(full(page));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    resp
}

async fn cacert(proxy: &Proxy) -> Response<CompyBody> {
    let Some(path) = &proxy.public_cert else {
        return status_response(StatusCode::NOT_FOUND);
    };
    match tokio::fs::read(path).await {
        Ok(pem) => {
            let mut resp = Response::new(full(pem));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-x509-ca-cert"),
            );
            resp
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "ca certificate unreadable");
            status_response(StatusCode::NOT_FOUND)
        }
    }
}
