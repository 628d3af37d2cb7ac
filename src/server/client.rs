//! Per-client handler: one request, then either a short reply or the
//! streaming loop until the peer or the session goes away.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::pipeline::FrameQueue;
use crate::server::request::{Request, StreamFormat};
use crate::server::wire::{self, CONFIG_TIMESTAMP, PING_RESPONSE, TALLY_RESPONSE};
use crate::state::SharedState;
use crate::ServerConfig;

/// Longest request line we look at.
pub const MAX_REQUEST_LEN: usize = 1024;

/// Why a streaming loop ended.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Stopped,
    PeerGone,
}

pub(crate) struct ClientSession {
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<SharedState>,
    queue: Arc<FrameQueue>,
    poll_timeout: Duration,
    last_sent: Option<Instant>,
    cursor: u64,
    /// Config instance already delivered to this client
    sent_config: Option<Arc<Bytes>>,
}

impl ClientSession {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        shared: Arc<SharedState>,
        queue: Arc<FrameQueue>,
        config: &ServerConfig,
    ) -> io::Result<Self> {
        // Accepted sockets may inherit non-blocking mode from the listener
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(config.read_timeout()))?;
        stream.set_write_timeout(Some(config.write_timeout()))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            peer,
            shared,
            queue,
            poll_timeout: config.poll_timeout(),
            last_sent: None,
            cursor: 0,
            sent_config: None,
        })
    }

    /// Serve the connection to completion. Errors stay local to this client.
    pub(crate) fn run(mut self) {
        let request = match self.read_request() {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("{} closed before sending a request", self.peer);
                return;
            }
            Err(e) if is_timeout(&e) => {
                debug!("{} sent no request in time, dropping", self.peer);
                return;
            }
            Err(e) => {
                debug!("{} request read failed: {}", self.peer, e);
                return;
            }
        };

        let result = match request {
            Request::Ping => self.reply(PING_RESPONSE),
            Request::Tally => self.reply(TALLY_RESPONSE),
            Request::Video { format } => self.stream_video(format),
            Request::Unknown => {
                debug!("{} sent an unrecognized request", self.peer);
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!("{} connection error: {}", self.peer, e);
        }
    }

    fn read_request(&mut self) -> io::Result<Option<Request>> {
        let mut buf = [0u8; MAX_REQUEST_LEN];
        let n = self.stream.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Request::parse(&buf[..n])))
    }

    fn reply(&mut self, response: &[u8]) -> io::Result<()> {
        self.stream.write_all(response)?;
        self.stream.flush()
    }

    fn stream_video(&mut self, format: StreamFormat) -> io::Result<()> {
        let codec_client = format.wants_codec_config();
        let clients = self.shared.client_connected();
        info!("{} streaming {} ({} client(s))", self.peer, format, clients);

        let exit = self.stream_loop(codec_client);

        let clients = self.shared.client_disconnected();
        match exit {
            Ok(Exit::Stopped) => info!("{} closed, session stopped", self.peer),
            Ok(Exit::PeerGone) => info!("{} disconnected ({} client(s) left)", self.peer, clients),
            Err(e) => info!("{} dropped: {} ({} client(s) left)", self.peer, e, clients),
        }
        Ok(())
    }

    fn stream_loop(&mut self, codec_client: bool) -> io::Result<Exit> {
        while self.shared.is_running() {
            let Some(frame) = self.queue.poll_after(self.cursor, self.poll_timeout) else {
                continue;
            };
            if !self.shared.is_running() {
                break;
            }

            let interval = pacing_interval(self.shared.snapshot().target_fps());
            if self.last_sent.is_some_and(|at| at.elapsed() < interval) {
                // Too early for this client; the next poll brings a fresher frame
                self.cursor = frame.sequence;
                continue;
            }

            if codec_client {
                self.send_codec_config()?;
            }
            match wire::write_unit(&mut self.stream, frame.timestamp_ms, &frame.data) {
                Ok(written) => {
                    metrics::counter!("lenscast_bytes_sent_total").increment(written as u64);
                    trace!("{} <- #{} ({} bytes)", self.peer, frame.sequence, written);
                }
                Err(e) if is_disconnect(&e) => return Ok(Exit::PeerGone),
                Err(e) => return Err(e),
            }
            self.cursor = frame.sequence;
            self.last_sent = Some(Instant::now());
        }
        Ok(Exit::Stopped)
    }

    /// Deliver the cached codec config once per encoder instance, and ask for
    /// a key frame so the new decoder does not wait a full GOP.
    fn send_codec_config(&mut self) -> io::Result<()> {
        let Some(config) = self.shared.codec_config() else {
            return Ok(());
        };
        if self
            .sent_config
            .as_ref()
            .is_some_and(|sent| Arc::ptr_eq(sent, &config))
        {
            return Ok(());
        }

        wire::write_unit(&mut self.stream, CONFIG_TIMESTAMP, &config)?;
        debug!("{} <- codec config ({} bytes)", self.peer, config.len());
        self.shared.request_key_frame();
        self.sent_config = Some(config);
        Ok(())
    }
}

fn pacing_interval(fps: u32) -> Duration {
    Duration::from_millis(1000 / u64::from(fps.max(1)))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}
