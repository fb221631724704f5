//! Hijacked connection wrapper with a close notification.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

/// Wraps a hijacked client connection. When the wrapper is dropped,
/// the paired [`ClosedSignal`] resolves so the CONNECT handler can keep
/// the upgraded request alive until the tunnel is actually finished.
pub struct MitmConn<I> {
    inner: I,
    closed: Option<oneshot::Sender<()>>,
}

impl<I> MitmConn<I> {
    pub fn new(inner: I) -> (Self, ClosedSignal) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner,
                closed: Some(tx),
            },
            ClosedSignal(rx),
        )
    }
}

impl<I> Drop for MitmConn<I> {
    fn drop(&mut self) {
        if let Some(tx) = self.closed.take() {
            let _ = tx.send(());
        }
    }
}

impl<I: AsyncRead + Unpin> AsyncRead for MitmConn<I> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for MitmConn<I> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Resolves once the matching [`MitmConn`] has been dropped.
pub struct ClosedSignal(oneshot::Receiver<()>);

impl ClosedSignal {
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}
