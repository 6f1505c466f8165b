use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use h2sec_traits::{
    Dialer, Event, EventSource, Frame, FrameWriter, RawConnection, Target, DEFAULT_MAX_FRAME_SIZE,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use crate::codec::{self, EventDecoder, CLIENT_PREFACE};
use crate::tls::TlsProvider;
use crate::transport::{BoxedStream, TransportBuilder};

const READ_CHUNK: usize = 16 * 1024;

/// Encodes frames straight onto the write half of a stream.
pub struct StreamWriter<W> {
    inner: W,
    buf: BytesMut,
    max_frame_size: usize,
}

impl<W: AsyncWrite + Unpin + Send> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    async fn flush_buf(&mut self) -> Result<()> {
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        self.buf.clear();
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for StreamWriter<W> {
    async fn write_preface(&mut self) -> Result<()> {
        self.buf.extend_from_slice(CLIENT_PREFACE);
        self.flush_buf().await.context("failed to write connection preface")
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        trace!(?frame, "write");
        codec::encode_frame(&frame, self.max_frame_size, &mut self.buf);
        let written = self.flush_buf().await;
        // A failed write must not leave a partial frame for the next one.
        self.buf.clear();
        written.context("failed to write frame")
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reads frames off the read half and turns them into events.
pub struct StreamEvents<R> {
    inner: R,
    buf: BytesMut,
    decoder: EventDecoder,
    read_timeout: Duration,
    closed: bool,
}

impl<R: AsyncRead + Unpin + Send> StreamEvents<R> {
    pub fn new(inner: R, read_timeout: Duration) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: EventDecoder::new(),
            read_timeout,
            closed: false,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for StreamEvents<R> {
    async fn next_event(&mut self) -> Event {
        loop {
            if let Some(event) = self.decoder.decode(&mut self.buf) {
                trace!(%event, "read");
                return event;
            }
            if self.closed {
                return Event::ConnectionClosed;
            }

            self.buf.reserve(READ_CHUNK);
            // read_buf is cancel safe, so a timeout never drops bytes.
            match tokio::time::timeout(self.read_timeout, self.inner.read_buf(&mut self.buf)).await {
                Err(_) => return Event::Timeout,
                Ok(Ok(0)) => {
                    debug!("peer closed the connection");
                    self.closed = true;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("read failed: {}", e);
                    self.closed = true;
                }
            }
        }
    }
}

/// Dials the configured target over TCP, with TLS when asked to.
pub struct TcpDialer {
    target: Target,
    tls: Option<TlsProvider>,
}

impl TcpDialer {
    pub fn new(target: Target) -> Result<Self> {
        let tls = if target.tls {
            Some(TlsProvider::new(target.insecure)?)
        } else {
            None
        };
        Ok(Self { target, tls })
    }

    async fn open_stream(&self) -> Result<BoxedStream> {
        let addr = TransportBuilder::resolve(&self.target.host, self.target.port).await?;
        let tcp = TransportBuilder::connect(addr).await?;
        debug!("connected to {}", addr);

        let stream = TransportBuilder::into_boxed(tcp);
        match &self.tls {
            Some(provider) => provider.handshake(&self.target.host, stream).await,
            None => Ok(stream),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<RawConnection> {
        let stream = tokio::time::timeout(self.target.read_timeout, self.open_stream())
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to {}", self.target.authority()))??;

        let (reader, writer): (ReadHalf<BoxedStream>, WriteHalf<BoxedStream>) =
            tokio::io::split(stream);
        Ok(RawConnection::new(
            StreamWriter::new(writer),
            StreamEvents::new(reader, self.target.read_timeout),
        ))
    }
}
