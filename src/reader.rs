//! A read window over a raw stream with an explicitly sized backing slab.
//!
//! The reader never grows on its own: callers that need a larger window swap
//! the slab with [`FixedReader::reset`] and get the old one back to return it
//! to the pool.
use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Buffered reader over one slab with read/write cursors.
///
/// Bytes in `buf[r..w]` have been read from the stream but not yet consumed.
pub struct FixedReader<R> {
    inner: R,
    buf: Vec<u8>,
    r: usize,
    w: usize,
}

impl<R> FixedReader<R> {
    pub fn new(inner: R, buf: Vec<u8>) -> Self {
        Self {
            inner,
            buf,
            r: 0,
            w: 0,
        }
    }

    /// Creates a reader whose window starts with `leftover`, bytes that were
    /// already read from `inner` by someone else (typically the HTTP upgrade).
    ///
    /// If `buf` is too small to hold them it is replaced by an exact fit.
    pub fn with_leftover(inner: R, mut buf: Vec<u8>, leftover: &[u8]) -> Self {
        if buf.len() < leftover.len() {
            buf = vec![0u8; leftover.len()];
        }
        buf[..leftover.len()].copy_from_slice(leftover);
        Self {
            inner,
            buf,
            r: 0,
            w: leftover.len(),
        }
    }

    /// Unconsumed bytes.
    #[inline]
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.r..self.w]
    }

    #[inline]
    pub fn buffered_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.r..self.w]
    }

    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.w - self.r
    }

    /// Size of the backing slab.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Writable bytes, counting both the space after the write cursor and the
    /// consumed space in front of the read cursor.
    #[inline]
    pub fn available(&self) -> usize {
        self.buf.len() - self.buffered_len()
    }

    /// Marks `n` buffered bytes as consumed.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.buffered_len(), "consumed more than buffered");
        self.r += n;
        if self.r == self.w {
            self.r = 0;
            self.w = 0;
        }
    }

    /// Moves the unconsumed bytes to the front of the slab.
    pub fn left_move(&mut self) {
        if self.r == 0 {
            return;
        }
        self.buf.copy_within(self.r..self.w, 0);
        self.w -= self.r;
        self.r = 0;
    }

    /// Swaps the backing slab, carrying unconsumed bytes over, and returns the
    /// previous slab.
    ///
    /// # Panics
    ///
    /// Panics if `buf` cannot hold the unconsumed bytes.
    pub fn reset(&mut self, mut buf: Vec<u8>) -> Vec<u8> {
        let len = self.buffered_len();
        assert!(buf.len() >= len, "replacement slab too small");
        buf[..len].copy_from_slice(self.buffered());
        self.r = 0;
        self.w = len;
        std::mem::replace(&mut self.buf, buf)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Returns the stream and the slab; unconsumed bytes are lost.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.buf)
    }
}

impl<R: AsyncRead + Unpin> FixedReader<R> {
    /// Reads until at least `n` bytes are buffered.
    ///
    /// `n` must not exceed [`capacity`](Self::capacity). Fails with
    /// `UnexpectedEof` if the stream ends first.
    pub async fn fill(&mut self, n: usize) -> io::Result<()> {
        debug_assert!(n <= self.buf.len());
        if self.buffered_len() >= n {
            return Ok(());
        }
        if self.buf.len() - self.r < n {
            self.left_move();
        }

        while self.buffered_len() < n {
            let read = self.inner.read(&mut self.buf[self.w..]).await?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.w += read;
        }

        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FixedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.r == this.w {
            // large reads bypass the window
            if dst.remaining() >= this.buf.len() {
                return Pin::new(&mut this.inner).poll_read(cx, dst);
            }

            this.r = 0;
            this.w = 0;
            let mut window = ReadBuf::new(&mut this.buf);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut window))?;
            this.w = window.filled().len();
        }

        let n = dst.remaining().min(this.w - this.r);
        dst.put_slice(&this.buf[this.r..this.r + n]);
        this.consume(n);

        Poll::Ready(Ok(()))
    }
}
