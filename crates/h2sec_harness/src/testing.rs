//! In-memory scripted server for driving checks without a network.
//!
//! Every dialed connection gets its own [`ScriptedServer`] from the
//! [`MockDialer`] factory. Frames the client writes are answered
//! synchronously by the script and appended, with the (tokio) time they were
//! written, to a [`FrameLog`] shared by all connections of one dialer.

use async_trait::async_trait;
use h2sec_traits::{
    Dialer, Event, EventSource, Frame, FrameWriter, RawConnection, Setting, SettingId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::Config;
use crate::group::CheckContext;

type Responder = Arc<Mutex<dyn FnMut(&Frame) -> Vec<Event> + Send>>;

/// Server behavior for one connection.
///
/// Every frame is first handed to the `on_frame` script; replying
/// [`Event::ConnectionClosed`] hangs up. The first client SETTINGS is then
/// answered with the server's SETTINGS and an ACK, later ones with an ACK
/// only.
#[derive(Clone, Default)]
pub struct ScriptedServer {
    settings: Vec<Setting>,
    responder: Option<Responder>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setting(mut self, id: SettingId, value: u32) -> Self {
        self.settings.push(Setting::new(id, value));
        self
    }

    pub fn max_concurrent_streams(self, n: u32) -> Self {
        self.setting(SettingId::MAX_CONCURRENT_STREAMS, n)
    }

    pub fn on_frame(mut self, f: impl FnMut(&Frame) -> Vec<Event> + Send + 'static) -> Self {
        self.responder = Some(Arc::new(Mutex::new(f)));
        self
    }
}

/// A frame as the scripted server received it.
#[derive(Debug, Clone)]
pub struct Written {
    /// Index of the connection, in dial order from 0.
    pub conn: usize,
    pub at: Instant,
    pub frame: Frame,
}

#[derive(Clone, Default)]
pub struct FrameLog(Arc<Mutex<Vec<Written>>>);

impl FrameLog {
    pub fn snapshot(&self) -> Vec<Written> {
        self.0.lock().clone()
    }

    pub fn frames_on(&self, conn: usize) -> Vec<Frame> {
        self.0
            .lock()
            .iter()
            .filter(|w| w.conn == conn)
            .map(|w| w.frame.clone())
            .collect()
    }

    /// HEADERS frames written on any connection.
    pub fn headers(&self) -> Vec<Written> {
        self.0
            .lock()
            .iter()
            .filter(|w| matches!(w.frame, Frame::Headers { .. }))
            .cloned()
            .collect()
    }

    fn push(&self, written: Written) {
        self.0.lock().push(written);
    }
}

struct MockWriter {
    conn: usize,
    server: ScriptedServer,
    settings_seen: bool,
    log: FrameLog,
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl MockWriter {
    fn reply(&mut self, events: Vec<Event>) {
        for event in events {
            if event == Event::ConnectionClosed {
                self.tx = None;
                return;
            }
            if let Some(tx) = &self.tx {
                let _ = tx.send(event);
            }
        }
    }
}

#[async_trait]
impl FrameWriter for MockWriter {
    async fn write_preface(&mut self) -> anyhow::Result<()> {
        if self.tx.is_none() {
            anyhow::bail!("connection closed by peer");
        }
        Ok(())
    }

    async fn write_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
        if self.tx.is_none() {
            anyhow::bail!("connection closed by peer");
        }
        self.log.push(Written {
            conn: self.conn,
            at: Instant::now(),
            frame: frame.clone(),
        });

        if let Some(responder) = self.server.responder.clone() {
            let replies = {
                let mut script = responder.lock();
                (&mut *script)(&frame)
            };
            self.reply(replies);
        }
        if let Frame::Settings(_) = frame {
            let mut replies = Vec::new();
            if !self.settings_seen {
                self.settings_seen = true;
                replies.push(Event::Settings(self.server.settings.clone()));
            }
            replies.push(Event::SettingsAck);
            self.reply(replies);
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MockEvents {
    rx: mpsc::UnboundedReceiver<Event>,
    read_timeout: Duration,
}

#[async_trait]
impl EventSource for MockEvents {
    async fn next_event(&mut self) -> Event {
        match tokio::time::timeout(self.read_timeout, self.rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => Event::ConnectionClosed,
            Err(_) => Event::Timeout,
        }
    }
}

/// Hands out a fresh scripted connection per dial.
pub struct MockDialer {
    factory: Box<dyn Fn() -> ScriptedServer + Send + Sync>,
    dialed: AtomicUsize,
    log: FrameLog,
    read_timeout: Duration,
}

impl MockDialer {
    pub fn new(factory: impl Fn() -> ScriptedServer + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            dialed: AtomicUsize::new(0),
            log: FrameLog::default(),
            read_timeout: Duration::from_secs(2),
        }
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn log(&self) -> FrameLog {
        self.log.clone()
    }

    pub fn dialed(&self) -> usize {
        self.dialed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self) -> anyhow::Result<RawConnection> {
        let conn = self.dialed.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = MockWriter {
            conn,
            server: (self.factory)(),
            settings_seen: false,
            log: self.log.clone(),
            tx: Some(tx),
        };
        let events = MockEvents {
            rx,
            read_timeout: self.read_timeout,
        };
        Ok(RawConnection::new(writer, events))
    }
}

/// A check context dialing through `dialer`.
pub fn context(config: Config, dialer: Arc<MockDialer>) -> CheckContext {
    CheckContext::new(Arc::new(config), dialer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test(start_paused = true)]
    async fn handshake_applies_server_settings() {
        let dialer = Arc::new(MockDialer::new(|| ScriptedServer::new().max_concurrent_streams(5)));
        let ctx = context(Config::default(), dialer.clone());

        let mut conn = ctx.connect().await.unwrap();
        conn.handshake().await.unwrap();

        assert_eq!(conn.settings().max_concurrent_streams(), Some(5));
        assert_eq!(dialer.dialed(), 1);
        assert_eq!(
            dialer.log().frames_on(0),
            vec![Frame::Settings(vec![]), Frame::SettingsAck]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hang_up_fails_later_writes() {
        let dialer = Arc::new(MockDialer::new(|| {
            ScriptedServer::new().on_frame(|frame| match frame {
                Frame::Data { .. } => vec![Event::ConnectionClosed],
                _ => vec![],
            })
        }));
        let ctx = context(Config::default(), dialer.clone());
        let mut conn = ctx.connect().await.unwrap();
        conn.handshake().await.unwrap();

        conn.write_data(1, true, Bytes::from_static(b"x")).await.unwrap();
        assert!(conn.write_data(3, true, Bytes::new()).await.is_err());
        assert_eq!(conn.wait_event().await, Event::ConnectionClosed);
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let dialer = Arc::new(
            MockDialer::new(ScriptedServer::new).read_timeout(Duration::from_millis(50)),
        );
        let ctx = context(Config::default(), dialer);
        let mut conn = ctx.connect().await.unwrap();
        conn.handshake().await.unwrap();

        let started = Instant::now();
        assert_eq!(conn.wait_event().await, Event::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
