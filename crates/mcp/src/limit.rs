//! Bound on the length of a single line read from a backend.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, ReadBuf};

/// Longest line accepted from a backend's stdout, in bytes.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Reader that fails with `InvalidData` once a line runs past `max` bytes
/// without a newline.
pub(crate) struct LineLimit<R> {
    inner: R,
    max: usize,
    current: usize,
}

impl<R> LineLimit<R> {
    pub(crate) fn new(inner: R, max: usize) -> Self {
        Self {
            inner,
            max,
            current: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LineLimit<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        for &byte in &buf.filled()[before..] {
            if byte == b'\n' {
                this.current = 0;
                continue;
            }
            this.current += 1;
            if this.current > this.max {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {} bytes", this.max),
                )));
            }
        }
        Poll::Ready(Ok(()))
    }
}
