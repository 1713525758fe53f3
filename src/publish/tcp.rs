//! TCP publish transport and a matching sink server
//!
//! URLs look like `tcp://host[:port]/app`; the default port is 1935. This
//! transport uses its own framing, so `rtmp://` URLs are refused with
//! [`TransportError::UnsupportedScheme`] instead of failing mid-handshake.
//! The write half stays with the connection; a reader task owns the read
//! half and turns server replies and EOF into liveness flags.

use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::PublishConnection;
use super::wire::{read_message, write_message, Message};
use crate::error::TransportError;
use crate::video::encoder::EncodedSample;

/// Default publish port
pub const DEFAULT_PORT: u16 = 1935;

/// Parsed publish URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub app: String,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let bad = |reason: &str| TransportError::ConnectFailed(format!("{}: {}", url, reason));

        let (scheme, rest) = url.split_once("://").ok_or_else(|| bad("missing scheme"))?;
        if !scheme.eq_ignore_ascii_case("tcp") {
            return Err(TransportError::UnsupportedScheme(scheme.to_string()));
        }
        let (authority, app) = match rest.split_once('/') {
            Some((authority, app)) => (authority, app.trim_end_matches('/')),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(bad("missing host"));
        }

        let parse_port = |port: &str| port.parse::<u16>().map_err(|_| bad("invalid port"));
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // [v6]:port
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| bad("unterminated IPv6 host"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(bad("invalid port")),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (authority, DEFAULT_PORT),
            }
        };
        if host.is_empty() {
            return Err(bad("missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            app: app.to_string(),
        })
    }
}

/// Liveness flags shared with the reader task
#[derive(Default)]
struct Link {
    connected: AtomicBool,
    publishing: AtomicBool,
}

impl Link {
    fn drop_all(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.publishing.store(false, Ordering::SeqCst);
    }
}

/// Handshake reply forwarded by the reader task
enum Reply {
    Accepted,
    Rejected(String),
}

/// Publish connection over plain TCP
pub struct TcpPublishConnection {
    writer: Option<OwnedWriteHalf>,
    replies: Option<mpsc::Receiver<Reply>>,
    reader: Option<JoinHandle<()>>,
    link: Arc<Link>,
    buf: BytesMut,
}

impl Default for TcpPublishConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpPublishConnection {
    pub fn new() -> Self {
        Self {
            writer: None,
            replies: None,
            reader: None,
            link: Arc::new(Link::default()),
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    async fn write(&mut self, message: &Message) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(e) = write_message(writer, message, &mut self.buf).await {
            self.link.drop_all();
            return Err(e.into());
        }
        Ok(())
    }

    async fn await_reply(&mut self) -> Option<Reply> {
        self.replies.as_mut()?.recv().await
    }

    fn teardown(&mut self) {
        self.link.drop_all();
        self.writer = None;
        self.replies = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_replies(mut reader: OwnedReadHalf, link: Arc<Link>, replies: mpsc::Sender<Reply>) {
    loop {
        match read_message(&mut reader).await {
            Ok(Message::Accepted) => {
                let _ = replies.send(Reply::Accepted).await;
            }
            Ok(Message::Rejected { reason }) => {
                let _ = replies.send(Reply::Rejected(reason)).await;
            }
            Ok(Message::Unpublished) => {
                info!("Server ended the publish session");
                link.publishing.store(false, Ordering::SeqCst);
            }
            Ok(other) => debug!("Ignoring unexpected server message {:?}", other),
            Err(e) => {
                debug!("Publish connection read side closed: {}", e);
                link.drop_all();
                break;
            }
        }
    }
}

#[async_trait]
impl PublishConnection for TcpPublishConnection {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        self.teardown();
        let endpoint = Endpoint::parse(url)?;

        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| {
                TransportError::ConnectFailed(format!(
                    "{}:{}: {}",
                    endpoint.host, endpoint.port, e
                ))
            })?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (reply_tx, reply_rx) = mpsc::channel(4);
        self.link = Arc::new(Link::default());
        self.reader = Some(tokio::spawn(read_replies(
            read_half,
            self.link.clone(),
            reply_tx,
        )));
        self.writer = Some(write_half);
        self.replies = Some(reply_rx);

        self.write(&Message::Hello {
            app: endpoint.app.clone(),
        })
        .await?;
        match self.await_reply().await {
            Some(Reply::Accepted) => {
                self.link.connected.store(true, Ordering::SeqCst);
                debug!("Connected to {}:{}", endpoint.host, endpoint.port);
                Ok(())
            }
            Some(Reply::Rejected(reason)) => {
                self.teardown();
                Err(TransportError::ConnectFailed(reason))
            }
            None => {
                self.teardown();
                Err(TransportError::ConnectFailed(
                    "connection closed during handshake".to_string(),
                ))
            }
        }
    }

    async fn publish(&mut self, stream_key: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.write(&Message::Publish {
            key: stream_key.to_string(),
        })
        .await?;
        match self.await_reply().await {
            Some(Reply::Accepted) => {
                self.link.publishing.store(true, Ordering::SeqCst);
                Ok(())
            }
            Some(Reply::Rejected(reason)) => Err(TransportError::PublishRejected(reason)),
            None => Err(TransportError::DroppedAfterPublish),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let result = if self.is_connected() {
            self.write(&Message::Close).await
        } else {
            Ok(())
        };
        if let Some(mut writer) = self.writer.take() {
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        }
        self.teardown();
        result
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some() && self.link.connected.load(Ordering::SeqCst)
    }

    fn is_publishing(&self) -> bool {
        self.is_connected() && self.link.publishing.load(Ordering::SeqCst)
    }

    async fn send(&mut self, sample: &EncodedSample) -> Result<(), TransportError> {
        if !self.is_publishing() {
            return Err(TransportError::NotConnected);
        }
        let message = Message::Sample {
            key_frame: sample.key_frame,
            codec: sample.codec,
            width: sample.resolution.width as u16,
            height: sample.resolution.height as u16,
            pts_ms: sample.pts_ms,
            sequence: sample.sequence,
            payload: sample.data.clone(),
        };
        self.write(&message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Counters kept by [`TcpSink`]
#[derive(Debug, Default)]
pub struct SinkCounters {
    pub sessions: AtomicU64,
    pub samples: AtomicU64,
    pub bytes: AtomicU64,
    pub key_frames: AtomicU64,
}

/// Minimal receiving end of the TCP publish transport
///
/// Accepts any application name, optionally checks the stream key and
/// counts what arrives. Used by the `sink` subcommand and in tests.
pub struct TcpSink {
    listener: TcpListener,
    expected_key: Option<String>,
    counters: Arc<SinkCounters>,
}

impl TcpSink {
    pub async fn bind(addr: SocketAddr, expected_key: Option<String>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            expected_key,
            counters: Arc::new(SinkCounters::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn counters(&self) -> Arc<SinkCounters> {
        self.counters.clone()
    }

    /// Accept publishers until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!("Sink listening on {:?}", self.listener.local_addr());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("Publisher connected from {}", peer);
                        let key = self.expected_key.clone();
                        let counters = self.counters.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = serve_publisher(stream, key, counters) => {
                                    if let Err(e) = result {
                                        debug!("Publisher {} went away: {}", peer, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => warn!("Sink accept error: {}", e),
                },
            }
        }
        info!("Sink stopped");
    }
}

async fn serve_publisher(
    mut stream: TcpStream,
    expected_key: Option<String>,
    counters: Arc<SinkCounters>,
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    loop {
        match read_message(&mut stream).await? {
            Message::Hello { app } => {
                debug!("Publisher opened app '{}'", app);
                write_message(&mut stream, &Message::Accepted, &mut buf).await?;
            }
            Message::Publish { key } => {
                let reply = match &expected_key {
                    Some(expected) if *expected != key => Message::Rejected {
                        reason: "invalid stream key".to_string(),
                    },
                    _ => {
                        counters.sessions.fetch_add(1, Ordering::Relaxed);
                        Message::Accepted
                    }
                };
                write_message(&mut stream, &reply, &mut buf).await?;
            }
            Message::Sample {
                key_frame,
                sequence,
                payload,
                ..
            } => {
                counters.samples.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                if key_frame {
                    counters.key_frames.fetch_add(1, Ordering::Relaxed);
                }
                if sequence % 300 == 0 {
                    debug!("Received sample #{} ({} bytes)", sequence, payload.len());
                }
            }
            Message::Close => return Ok(()),
            other => debug!("Ignoring unexpected client message {:?}", other),
        }
    }
}
