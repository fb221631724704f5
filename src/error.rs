//! Error taxonomy for the proxy.
//!
//! Configuration problems surface at startup, everything else is
//! per-request: forwarding failures become a 500 toward the client, MITM
//! bridging failures tear down the tunnel, and transcoding failures abort
//! the response body mid-stream (the status line is already committed by
//! then, which is accepted behavior rather than something to buffer around).

use std::path::PathBuf;

/// Errors produced by the proxy core, the MITM subsystem and the
/// transcoder pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CompyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("failed to forge certificate: {0}")]
    CertForge(String),

    #[error("error forwarding request: {0}")]
    Forward(#[from] hyper_util::client::legacy::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("invalid upstream address: {0}")]
    Address(String),

    #[error("image transcoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("webp encoding error: {0}")]
    Webp(String),

    #[error("minification error: {0}")]
    Minify(String),
}
