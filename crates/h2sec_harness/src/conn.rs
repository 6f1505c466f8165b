use anyhow::Result;
use bytes::Bytes;
use h2sec_traits::{
    Event, EventSource, Frame, FrameWriter, HeaderField, HeadersParam, PeerSettings,
    PriorityParam, RawConnection, Setting,
};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::hpack::HpackEncoder;

/// The single critical section every write on one connection goes through.
///
/// Clones share the same writer, so frames written from the main loop and
/// from spawned tasks never interleave on the wire.
#[derive(Clone)]
pub struct WriteLock {
    writer: Arc<Mutex<Box<dyn FrameWriter>>>,
}

impl WriteLock {
    fn new(writer: Box<dyn FrameWriter>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Holds the lock across several writes.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn FrameWriter>> {
        self.writer.lock().await
    }

    pub async fn write(&self, frame: Frame) -> Result<()> {
        self.lock().await.write_frame(frame).await
    }
}

/// A client connection as the checks see it.
pub struct Conn {
    writer: WriteLock,
    events: Box<dyn EventSource>,
    encoder: HpackEncoder,
    settings: PeerSettings,
    closed: bool,
}

impl Conn {
    pub fn new(raw: RawConnection) -> Self {
        Self {
            writer: WriteLock::new(raw.writer),
            events: raw.events,
            encoder: HpackEncoder::default(),
            settings: PeerSettings::default(),
            closed: false,
        }
    }

    /// Connection preface and SETTINGS exchange (RFC 7540 Section 3.5).
    ///
    /// Returns once the server's SETTINGS have been acknowledged and our own
    /// SETTINGS were acknowledged by the server.
    pub async fn handshake(&mut self) -> Result<()> {
        {
            let mut writer = self.writer.lock().await;
            writer.write_preface().await?;
            writer.write_frame(Frame::Settings(Vec::new())).await?;
        }

        let mut got_settings = false;
        let mut got_ack = false;
        while !(got_settings && got_ack) {
            match self.wait_event().await {
                Event::Settings(settings) => {
                    self.settings.apply(&settings);
                    self.writer.write(Frame::SettingsAck).await?;
                    got_settings = true;
                }
                Event::SettingsAck => got_ack = true,
                event @ (Event::ConnectionClosed | Event::Timeout) => {
                    anyhow::bail!("handshake did not complete: {}", event)
                }
                Event::GoAway { .. } => anyhow::bail!("server sent GOAWAY during handshake"),
                event => debug!(%event, "ignored during handshake"),
            }
        }

        debug!(settings = ?self.settings, "handshake complete");
        Ok(())
    }

    pub fn encode_headers(&mut self, fields: &[HeaderField]) -> Bytes {
        self.encoder.encode(fields)
    }

    pub async fn write_headers(&mut self, param: HeadersParam) -> Result<()> {
        self.writer.write(param.into()).await
    }

    pub async fn write_data(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        payload: Bytes,
    ) -> Result<()> {
        self.writer
            .write(Frame::Data {
                stream_id,
                end_stream,
                payload,
            })
            .await
    }

    pub async fn write_priority(&mut self, stream_id: u32, priority: PriorityParam) -> Result<()> {
        self.writer
            .write(Frame::Priority {
                stream_id,
                priority,
            })
            .await
    }

    pub async fn write_settings(&mut self, settings: Vec<Setting>) -> Result<()> {
        self.writer.write(Frame::Settings(settings)).await
    }

    pub async fn write_window_update(&mut self, stream_id: u32, increment: u32) -> Result<()> {
        self.writer
            .write(Frame::WindowUpdate {
                stream_id,
                increment,
            })
            .await
    }

    /// A handle onto this connection's write lock, for writers running in
    /// other tasks.
    pub fn write_lock(&self) -> WriteLock {
        self.writer.clone()
    }

    /// Waits for the next event. Once the peer has gone away every later call
    /// returns [`Event::ConnectionClosed`].
    pub async fn wait_event(&mut self) -> Event {
        if self.closed {
            return Event::ConnectionClosed;
        }
        let event = self.events.next_event().await;
        if event == Event::ConnectionClosed {
            self.closed = true;
        }
        event
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.lock().await.shutdown().await
    }

    pub fn settings(&self) -> &PeerSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
