//! Compression decorators.
//!
//! Both wrappers hold an inner [`Transcoder`], substitute the response
//! reader/writer with (de)compressing ones, fix up the `Content-Encoding`
//! headers on both sides, and delegate. Dropping the writer stack at the
//! end of the pipeline finalizes the encoder's trailing bytes.

use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_ENCODING};

use crate::error::CompyError;
use crate::proxy::response::{ResponseReader, ResponseWriter};
use crate::transcode::{accepted_encodings, Transcoder};

fn content_encoding(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok())
}

fn plain(r: &ResponseReader) -> bool {
    content_encoding(r.headers()).is_none()
}

fn strip_encoding(w: &mut ResponseWriter, r: &mut ResponseReader) {
    r.headers_mut().remove(CONTENT_ENCODING);
    w.headers_mut().remove(CONTENT_ENCODING);
}

/// Gzip-only wrapper: gunzips the body when re-encoding policy requires
/// raw bytes, re-gzips when the client accepts it.
pub struct Gzip {
    inner: Arc<dyn Transcoder>,
    level: u32,
    /// Leave already-gzipped bodies alone (pure pass-through swap).
    skip_gzipped: bool,
}

impl Gzip {
    pub fn new(inner: Arc<dyn Transcoder>, level: u32, skip_gzipped: bool) -> Self {
        Self {
            inner,
            level,
            skip_gzipped,
        }
    }
}

impl Transcoder for Gzip {
    fn transcode(
        &self,
        w: &mut ResponseWriter,
        r: &mut ResponseReader,
        headers: &HeaderMap,
    ) -> Result<(), CompyError> {
        if !self.skip_gzipped && content_encoding(r.headers()) == Some("gzip") {
            let inner = r.take_reader();
            r.set_reader(Box::new(GzDecoder::new(inner)));
            strip_encoding(w, r);
        }

        let (_, should_gzip) = accepted_encodings(headers);
        if should_gzip && plain(r) {
            let inner = w.take_writer();
            w.set_writer(Box::new(GzEncoder::new(inner, Compression::new(self.level))));
            w.headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        self.inner.transcode(w, r, headers)
    }
}

/// Brotli-capable wrapper: decompresses gzip or brotli bodies as policy
/// requires, then re-encodes preferring brotli over gzip when both are
/// accepted.
pub struct Zip {
    inner: Arc<dyn Transcoder>,
    brotli_level: u32,
    gzip_level: u32,
    /// Leave already-compressed bodies alone unless the client accepts a
    /// better encoding than the origin sent.
    skip_compressed: bool,
}

impl Zip {
    pub fn new(
        inner: Arc<dyn Transcoder>,
        brotli_level: u32,
        gzip_level: u32,
        skip_compressed: bool,
    ) -> Self {
        Self {
            inner,
            brotli_level,
            gzip_level,
            skip_compressed,
        }
    }
}

impl Transcoder for Zip {
    fn transcode(
        &self,
        w: &mut ResponseWriter,
        r: &mut ResponseReader,
        headers: &HeaderMap,
    ) -> Result<(), CompyError> {
        let (should_brotli, should_gzip) = accepted_encodings(headers);

        // Gzip bodies are unpacked even in skip mode when the client
        // supports brotli, so they can be upgraded below.
        if content_encoding(r.headers()) == Some("gzip")
            && (should_brotli || !self.skip_compressed)
        {
            let inner = r.take_reader();
            r.set_reader(Box::new(GzDecoder::new(inner)));
            strip_encoding(w, r);
        }

        if content_encoding(r.headers()) == Some("br") && !self.skip_compressed {
            let inner = r.take_reader();
            r.set_reader(Box::new(brotli::Decompressor::new(inner, 4096)));
            strip_encoding(w, r);
        }

        if should_brotli && plain(r) {
            let inner = w.take_writer();
            w.set_writer(Box::new(brotli::CompressorWriter::new(
                inner,
                4096,
                self.brotli_level,
                22,
            )));
            w.headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        } else if should_gzip && plain(r) {
            let inner = w.take_writer();
            w.set_writer(Box::new(GzEncoder::new(
                inner,
                Compression::new(self.gzip_level),
            )));
            w.headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        self.inner.transcode(w, r, headers)
    }
}
