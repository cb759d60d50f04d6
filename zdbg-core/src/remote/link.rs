//! Byte-stream link to an external backend.
//!
//! The protocols spoken over the link carry no request identifiers, so a
//! reply is matched to its request by arrival order. An [`Exchange`] holds the
//! read side for the whole request/reply cycle; a second request waits until
//! the first one completes. The write side is locked separately so that an
//! out-of-band break can be sent while a request is pending.

use super::RemoteEvent;
use super::RemoteError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, MappedMutexGuard, Mutex, MutexGuard};

/// Anything a backend can talk to: a TCP stream, or an in-memory pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Transport for T {}

pub type LinkReader = BufReader<ReadHalf<Box<dyn Transport>>>;
type LinkWriter = WriteHalf<Box<dyn Transport>>;

pub struct Link {
    name: &'static str,
    reader: Mutex<Option<LinkReader>>,
    writer: Mutex<Option<LinkWriter>>,
    connected: AtomicBool,
    events: broadcast::Sender<RemoteEvent>,
}

impl Link {
    pub fn new(name: &'static str, events: broadcast::Sender<RemoteEvent>) -> Self {
        Self {
            name,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            events,
        }
    }

    pub async fn open_tcp(&self, host: &str, port: u16) -> Result<(), RemoteError> {
        log::info!("{}: connecting to {host}:{port}", self.name);
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        self.attach(Box::new(stream)).await;
        Ok(())
    }

    pub async fn attach(&self, transport: Box<dyn Transport>) {
        let (read, write) = split(transport);
        *self.reader.lock().await = Some(BufReader::new(read));
        *self.writer.lock().await = Some(write);
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Start a request/reply cycle. Waits for any cycle in flight.
    pub async fn begin(&self) -> Result<Exchange<'_>, RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::Disconnected);
        }
        let guard = self.reader.lock().await;
        let reader = MutexGuard::try_map(guard, |r| r.as_mut()).map_err(|_| RemoteError::Disconnected)?;
        if !self.is_connected() {
            return Err(RemoteError::Disconnected);
        }
        Ok(Exchange { link: self, reader })
    }

    /// Write without waiting for the current exchange, used for break requests.
    pub async fn send_out_of_band(&self, data: &[u8]) -> Result<(), RemoteError> {
        let result = self.write(data).await;
        self.check(result).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        writer.write_all(data).await?;
        writer.flush().await
    }

    async fn check<T>(&self, result: io::Result<T>) -> Result<T, RemoteError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.fail(&err).await;
                Err(RemoteError::Io(err))
            }
        }
    }

    /// The channel broke: drop the connection and tell the subscribers.
    async fn fail(&self, err: &io::Error) {
        if self.connected.swap(false, Ordering::SeqCst) {
            log::error!("{}: connection lost: {err}", self.name);
            let _ = self.events.send(RemoteEvent::Error(format!("{}: connection lost: {err}", self.name)));
        }
        self.writer.lock().await.take();
    }

    /// Close both halves. Waits for a pending exchange to complete.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        log::info!("{}: disconnected", self.name);
    }
}

/// One request/reply cycle on a [`Link`].
pub struct Exchange<'a> {
    link: &'a Link,
    reader: MappedMutexGuard<'a, LinkReader>,
}

impl Exchange<'_> {
    pub async fn send(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        let result = self.link.write(data).await;
        self.link.check(result).await
    }

    pub fn reader(&mut self) -> &mut LinkReader {
        &mut self.reader
    }

    /// Pass through the result of a read, dropping the connection on failure.
    pub async fn check<T>(&mut self, result: io::Result<T>) -> Result<T, RemoteError> {
        self.link.check(result).await
    }
}
