//! Buffered DIS channel over a byte stream.
//!
//! A `DisChan` owns its stream plus read/write staging buffers; it is
//! single-owner and never shared across tasks without external locking.
//! Reads are bounded by the channel's current timeout class and can be
//! broken early by the interrupt token.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, DisError};

/// Timeout classes used across the batch protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Initial connect, 10 s.
    Connect,
    /// Ordinary request/reply, 30 s.
    Short,
    /// File staging and renewals, 600 s.
    Long,
    /// Credential renewal class, 10800 s.
    VeryLong,
    /// Disabled entirely (NOTIMEOUT connections).
    None,
}

impl TimeoutClass {
    pub fn duration(self) -> Option<Duration> {
        match self {
            TimeoutClass::Connect => Some(Duration::from_secs(10)),
            TimeoutClass::Short => Some(Duration::from_secs(30)),
            TimeoutClass::Long => Some(Duration::from_secs(600)),
            TimeoutClass::VeryLong => Some(Duration::from_secs(10800)),
            TimeoutClass::None => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChanError {
    #[error(transparent)]
    Dis(#[from] DisError),
    #[error("read timed out")]
    Timeout,
    #[error("read interrupted")]
    Interrupted,
    #[error("connection closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

const READ_CHUNK: usize = 8 * 1024;

pub struct DisChan<S> {
    stream: S,
    rbuf: BytesMut,
    wbuf: BytesMut,
    timeout: TimeoutClass,
    interrupt: CancellationToken,
}

impl<S> DisChan<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            rbuf: BytesMut::with_capacity(READ_CHUNK),
            wbuf: BytesMut::with_capacity(READ_CHUNK),
            timeout: TimeoutClass::Short,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn with_interrupt(stream: S, interrupt: CancellationToken) -> Self {
        let mut chan = Self::new(stream);
        chan.interrupt = interrupt;
        chan
    }

    /// Rebuild a channel around a stream plus bytes already read off
    /// it (peeked handshakes).
    pub fn with_read_buffer(stream: S, rbuf: BytesMut) -> Self {
        let mut chan = Self::new(stream);
        chan.rbuf = rbuf;
        chan
    }

    /// Split into the stream and any unconsumed read bytes.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.rbuf)
    }

    pub fn set_timeout(&mut self, class: TimeoutClass) {
        self.timeout = class;
    }

    pub fn timeout(&self) -> TimeoutClass {
        self.timeout
    }

    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    pub fn write_uint(&mut self, v: u64) {
        codec::put_uint(&mut self.wbuf, v);
    }

    pub fn write_int(&mut self, v: i64) {
        codec::put_int(&mut self.wbuf, v);
    }

    pub fn write_string(&mut self, s: &str) {
        codec::put_string(&mut self.wbuf, s);
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        codec::put_bytes(&mut self.wbuf, b);
    }

    pub fn write_float(&mut self, v: f64) {
        codec::put_float(&mut self.wbuf, v);
    }

    pub fn write_raw(&mut self, b: &[u8]) {
        self.wbuf.extend_from_slice(b);
    }

    /// Detach everything staged for write without touching the stream.
    /// Used to build message payloads for the mesh transport.
    pub fn write_buffer(&mut self) -> BytesMut {
        self.wbuf.split()
    }

    /// Drop buffered state and hand the stream back.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> DisChan<S> {
    /// Pull more bytes off the stream into the read buffer, honoring the
    /// timeout class and interrupt token.
    async fn fill(&mut self) -> Result<(), ChanError> {
        let interrupt = self.interrupt.clone();
        let deadline = self.timeout.duration();
        let stream = &mut self.stream;
        let rbuf = &mut self.rbuf;
        let read = async move {
            let mut chunk = [0u8; READ_CHUNK];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ChanError::Closed);
            }
            rbuf.extend_from_slice(&chunk[..n]);
            Ok(())
        };
        tokio::pin!(read);
        match deadline {
            Some(d) => tokio::select! {
                _ = interrupt.cancelled() => Err(ChanError::Interrupted),
                r = tokio::time::timeout(d, &mut read) => r.map_err(|_| ChanError::Timeout)?,
            },
            None => tokio::select! {
                _ = interrupt.cancelled() => Err(ChanError::Interrupted),
                r = &mut read => r,
            },
        }
    }

    /// Run a slice parser against the buffer, refilling on `Eod` until the
    /// token is complete. Consumes exactly the token's bytes.
    async fn read_token<T>(
        &mut self,
        parse: impl Fn(&[u8]) -> Result<(T, usize), DisError>,
    ) -> Result<T, ChanError> {
        loop {
            match parse(&self.rbuf) {
                Ok((v, used)) => {
                    self.rbuf.advance(used);
                    return Ok(v);
                }
                Err(DisError::Eod) => self.fill().await?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn read_uint(&mut self) -> Result<u64, ChanError> {
        self.read_token(codec::take_uint).await
    }

    pub async fn read_int(&mut self) -> Result<i64, ChanError> {
        self.read_token(codec::take_int).await
    }

    pub async fn read_string(&mut self) -> Result<String, ChanError> {
        self.read_token(codec::take_string).await
    }

    pub async fn read_bytes(&mut self) -> Result<Vec<u8>, ChanError> {
        self.read_token(codec::take_bytes).await
    }

    pub async fn read_float(&mut self) -> Result<f64, ChanError> {
        self.read_token(codec::take_float).await
    }
}

impl<S: AsyncWrite + Unpin> DisChan<S> {
    pub async fn flush(&mut self) -> Result<(), ChanError> {
        if !self.wbuf.is_empty() {
            let out = self.wbuf.split();
            self.stream.write_all(&out).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = DisChan::new(a);
        let mut rx = DisChan::new(b);

        tx.write_uint(2);
        tx.write_string("alice");
        tx.write_int(-7);
        tx.flush().await.unwrap();

        assert_eq!(rx.read_uint().await.unwrap(), 2);
        assert_eq!(rx.read_string().await.unwrap(), "alice");
        assert_eq!(rx.read_int().await.unwrap(), -7);
    }

    #[tokio::test]
    async fn token_split_across_fills_is_reassembled() {
        let (a, b) = tokio::io::duplex(4); // tiny pipe forces partial reads
        let mut tx = DisChan::new(a);
        let mut rx = DisChan::new(b);

        let payload = "x".repeat(300);
        tx.write_string(&payload);
        let write = tokio::spawn(async move { tx.flush().await });
        assert_eq!(rx.read_string().await.unwrap(), payload);
        write.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_close_surfaces_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut rx = DisChan::new(b);
        match rx.read_uint().await {
            Err(ChanError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupt_breaks_pending_read() {
        let (_a, b) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let mut rx = DisChan::with_interrupt(b, token.clone());
        rx.set_timeout(TimeoutClass::None);
        let reader = tokio::spawn(async move { rx.read_uint().await });
        token.cancel();
        match reader.await.unwrap() {
            Err(ChanError::Interrupted) => {}
            other => panic!("expected Interrupted, got {other:?}"),
        }
    }
}
