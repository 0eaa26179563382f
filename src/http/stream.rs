//! Byte-level stream plumbing shared by the request and multipart parsers.

use crate::errors::ErrorKind;
use memchr::memmem;
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Nominal capacity of the pushback buffer.
pub(crate) const PUSHBACK_CAPACITY: usize = 16 * 1024;

/// Chunk size for body and upload streaming.
pub(crate) const CHUNK_SIZE: usize = 8 * 1024;

/// A buffered reader that can push already-consumed bytes back.
///
/// The multipart decoder reads ahead while hunting for boundaries and
/// returns whatever belongs to the next state via [`unread`](Self::unread);
/// pushed-back bytes reappear, in their original order, before anything new
/// is read from the underlying stream.
///
/// The reader never closes the stream it wraps: dropping it (or calling
/// [`into_inner`](Self::into_inner)) leaves the transport untouched, so the
/// caller is free to keep using the socket after parsing.
pub(crate) struct PushbackReader<R> {
    inner: R,
    pushback: VecDeque<u8>,
}

impl<R: AsyncRead + Unpin> PushbackReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            pushback: VecDeque::with_capacity(PUSHBACK_CAPACITY),
        }
    }

    /// Returns bytes to the stream; the next reads yield them first, in the
    /// order given.
    pub(crate) fn unread(&mut self, bytes: &[u8]) {
        for &b in bytes.iter().rev() {
            self.pushback.push_front(b);
        }
    }

    /// Reads into `buf`, serving pushed-back bytes before the underlying
    /// stream. Returns 0 only at end of stream.
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pushback.is_empty() {
            let n = buf.len().min(self.pushback.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pushback.pop_front().unwrap();
            }
            return Ok(n);
        }

        self.inner.read(buf).await
    }

    /// Reads a single byte; `None` at end of stream.
    pub(crate) async fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if let Some(b) = self.pushback.pop_front() {
            return Ok(Some(b));
        }

        let mut buf = [0u8; 1];
        match self.inner.read(&mut buf).await? {
            0 => Ok(None),
            _ => Ok(Some(buf[0])),
        }
    }

    /// Fills `buf` completely or fails with [`ErrorKind::UnexpectedEof`].
    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ErrorKind> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(ErrorKind::UnexpectedEof);
            }
            filled += n;
        }
        Ok(())
    }

    /// Accumulates bytes until the header terminator, `\r\n\r\n` (or the
    /// tolerated `\n\n`), and returns everything before it. The stream is
    /// left positioned on the first byte after the terminator.
    pub(crate) async fn read_header_block(&mut self, cap: usize) -> Result<Vec<u8>, ErrorKind> {
        let mut head: Vec<u8> = Vec::with_capacity(1024);
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Err(ErrorKind::UnexpectedEof);
            }

            // Re-scan with a small overlap so a terminator split across
            // reads is still found.
            let scan_from = head.len().saturating_sub(3);
            head.extend_from_slice(&chunk[..n]);

            let crlf = find_bytes(&head[scan_from..], b"\r\n\r\n").map(|i| (scan_from + i, 4));
            let lf = find_bytes(&head[scan_from..], b"\n\n").map(|i| (scan_from + i, 2));

            let hit = match (crlf, lf) {
                (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
                (a, b) => a.or(b),
            };

            if let Some((pos, term_len)) = hit {
                let after = head.split_off(pos + term_len);
                self.unread(&after);
                head.truncate(pos);
                return Ok(head);
            }

            if head.len() > cap {
                return Err(ErrorKind::HeaderBlockTooLarge);
            }
        }
    }

    /// Hands back the wrapped stream, dropping any pushed-back bytes.
    #[allow(dead_code)]
    pub(crate) fn into_inner(self) -> R {
        self.inner
    }
}

/// First occurrence of `needle` in `haystack`.
#[inline]
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memmem::find(haystack, needle)
}

/// Length of the longest suffix of `data` that is a proper prefix of
/// `needle`.
///
/// The multipart body reader holds that many bytes back at a chunk edge, in
/// case the boundary continues in the next read.
pub(crate) fn partial_suffix_len(data: &[u8], needle: &[u8]) -> usize {
    let max = needle.len().saturating_sub(1).min(data.len());
    for len in (1..=max).rev() {
        if data[data.len() - len..] == needle[..len] {
            return len;
        }
    }
    0
}
