//! Streaming adapters around an origin response and a client-facing sink.
//!
//! `ResponseReader` wraps the origin body as a blocking byte source whose
//! reader can be substituted mid-pipeline (a decompressing stage swaps a
//! gzip reader in front of it without downstream stages noticing).
//! `ResponseWriter` defers committing the status line and headers until the
//! first body byte so transcoders may still adjust headers after seeing the
//! body; the commit is a one-shot message consumed by the async handler,
//! which only then hands the response head to hyper.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::StatusCode;
use tokio::sync::{mpsc, oneshot};

/// Frozen response head, sent exactly once when headers commit.
pub type CommittedHead = (StatusCode, HeaderMap);

/// Readable origin response: body source, headers and status.
pub struct ResponseReader {
    reader: Box<dyn Read + Send>,
    headers: HeaderMap,
    status: StatusCode,
}

impl ResponseReader {
    pub fn new(reader: Box<dyn Read + Send>, status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            reader,
            headers,
            status,
        }
    }

    /// Media type of the response, lowercased, parameters discarded.
    pub fn content_type(&self) -> String {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Replace the byte source, returning the previous one so a transcoder
    /// stage can wrap it (e.g. in a decompressor).
    pub fn take_reader(&mut self) -> Box<dyn Read + Send> {
        std::mem::replace(&mut self.reader, Box::new(io::empty()))
    }

    pub fn set_reader(&mut self, reader: Box<dyn Read + Send>) {
        self.reader = reader;
    }
}

impl Read for ResponseReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Client-facing sink with deferred head commit.
///
/// Headers and status may be mutated freely until the first write; the
/// first write (or the writer being dropped) freezes them and sends the
/// commit message. Later mutations only touch the local copy and never
/// reach the client.
pub struct ResponseWriter {
    writer: Box<dyn Write + Send>,
    status: StatusCode,
    headers: HeaderMap,
    committed: bool,
    commit: Option<oneshot::Sender<CommittedHead>>,
}

impl ResponseWriter {
    pub fn new(writer: Box<dyn Write + Send>, commit: Option<oneshot::Sender<CommittedHead>>) -> Self {
        Self {
            writer,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            committed: false,
            commit,
        }
    }

    /// Bulk-copy the origin's status and headers so transcoders only need
    /// to adjust, not rebuild.
    pub fn take_headers(&mut self, r: &ResponseReader) {
        self.status = r.status();
        self.headers = r.headers().clone();
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Drop `Content-Length`: a transcoder is active and the body length is
    /// unknowable ahead of transformation, so framing falls back to
    /// chunked/close-delimited transfer.
    pub fn set_chunked(&mut self) {
        self.headers.remove(CONTENT_LENGTH);
    }

    /// Replace the byte sink, returning the previous one so a transcoder
    /// stage can wrap it (e.g. in a compressor).
    pub fn take_writer(&mut self) -> Box<dyn Write + Send> {
        std::mem::replace(&mut self.writer, Box::new(io::sink()))
    }

    pub fn set_writer(&mut self, writer: Box<dyn Write + Send>) {
        self.writer = writer;
    }

    /// Stream the remainder of `r` through this writer unchanged.
    pub fn read_from(&mut self, r: &mut ResponseReader) -> io::Result<()> {
        self.flush_headers();
        io::copy(r, self)?;
        Ok(())
    }

    fn flush_headers(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;
        if let Some(tx) = self.commit.take() {
            let _ = tx.send((self.status, self.headers.clone()));
        }
    }
}

impl Write for ResponseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush_headers();
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_headers();
        self.writer.flush()
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        // An empty body never triggers a write; commit the head anyway so
        // the handler is not left waiting. Dropping the writer stack
        // afterwards lets any wrapping encoder emit its trailer.
        self.flush_headers();
    }
}

/// Byte-counting reader, the innermost source under any decompressors.
pub struct CountingReader {
    inner: Box<dyn Read + Send>,
    count: Arc<AtomicU64>,
}

impl CountingReader {
    pub fn new(inner: Box<dyn Read + Send>, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Byte-counting writer, the outermost sink under any compressors.
pub struct CountingWriter {
    inner: Box<dyn Write + Send>,
    count: Arc<AtomicU64>,
}

impl CountingWriter {
    pub fn new(inner: Box<dyn Write + Send>, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Blocking writer feeding the streamed response body. Runs on the
/// blocking pool, so `blocking_send` parks the pipeline when the client
/// is slow to drain.
pub struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
