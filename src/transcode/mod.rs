//! Composable response transcoders.
//!
//! A [`Transcoder`] consumes a [`ResponseReader`] positioned at the body
//! start and produces bytes into a [`ResponseWriter`], with access to the
//! original request headers for content negotiation. Compression wrappers
//! are decorators that substitute the reader/writer and then delegate to an
//! inner transcoder; image codecs and the minifier are leaves.

use hyper::header::HeaderMap;

use crate::error::CompyError;
use crate::proxy::response::{ResponseReader, ResponseWriter};

mod identity;
mod image;
mod minify;
mod zip;

pub use identity::Identity;
pub use image::{Gif, Jpeg, Png, QUALITY_HEADER};
pub use minify::Minifier;
pub use zip::{Gzip, Zip};

/// One transformation stage. Implementations are registered per
/// content-type, shared across concurrent requests, and hold no per-call
/// mutable state.
pub trait Transcoder: Send + Sync {
    fn transcode(
        &self,
        w: &mut ResponseWriter,
        r: &mut ResponseReader,
        headers: &HeaderMap,
    ) -> Result<(), CompyError>;
}

/// Whether the client's `Accept` header lists WebP support.
pub fn accepts_webp(headers: &HeaderMap) -> bool {
    headers
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| {
            accept
                .split(',')
                .any(|part| part.split(';').next().unwrap_or("").trim() == "image/webp")
        })
        .unwrap_or(false)
}

/// Compressions the client accepts, negotiated strictly against
/// `Accept-Encoding`. Returns `(brotli, gzip)`.
pub fn accepted_encodings(headers: &HeaderMap) -> (bool, bool) {
    let mut brotli = false;
    let mut gzip = false;
    if let Some(value) = headers
        .get(hyper::header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
    {
        for part in value.split(',') {
            match part.split(';').next().unwrap_or("").trim() {
                "br" => brotli = true,
                "gzip" => gzip = true,
                _ => {}
            }
        }
    }
    (brotli, gzip)
}
