//! TCP stream server
//!
//! One accept thread plus one thread per client. The listener is
//! non-blocking and polled so that shutdown never waits on `accept()`.

pub mod client;
pub mod request;
pub mod wire;

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, StreamError};
use crate::pipeline::FrameQueue;
use crate::state::SharedState;
use crate::ServerConfig;

use client::ClientSession;

pub use request::{Request, StreamFormat};
pub use wire::{read_unit, write_unit, FrameHeader, CONFIG_TIMESTAMP, HEADER_LEN};

const LISTEN_BACKLOG: i32 = 128;

/// Live connection: a handle to unblock its socket and the thread serving it.
struct Connection {
    peer: SocketAddr,
    socket: TcpStream,
    handle: JoinHandle<()>,
}

type Connections = Arc<Mutex<Vec<Connection>>>;

pub struct StreamServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    config: ServerConfig,
    stop: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
    connections: Connections,
}

impl StreamServer {
    /// Bind `host:port` with address reuse. Failure is fatal to the caller's
    /// start attempt; nothing is left listening.
    #[instrument(skip(config))]
    pub fn bind(host: &str, port: u16, config: ServerConfig) -> Result<Self> {
        let label = format!("{host}:{port}");
        let bind_error = |source: std::io::Error| StreamError::Bind {
            addr: label.clone(),
            source,
        };

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(bind_error)?
            .next()
            .ok_or_else(|| bind_error(ErrorKind::AddrNotAvailable.into()))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket.bind(&addr.into()).map_err(bind_error)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;

        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!("Listening on {}", local_addr);
        Ok(Self {
            listener: Some(listener),
            local_addr,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            accept_handle: None,
            connections: Arc::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections whose handler thread is still alive.
    pub fn connection_count(&self) -> usize {
        let mut connections = lock(&self.connections);
        reap_finished(&mut connections);
        connections.len()
    }

    /// Spawn the accept loop. Clients stream while `shared` reports running.
    pub fn serve(&mut self, shared: Arc<SharedState>, queue: Arc<FrameQueue>) -> Result<()> {
        let Some(listener) = self.listener.take() else {
            return Err(StreamError::Unsupported("server is already serving".into()));
        };

        let stop = Arc::clone(&self.stop);
        let connections = Arc::clone(&self.connections);
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("stream-accept".into())
            .spawn(move || accept_loop(listener, config, stop, shared, queue, connections))?;

        self.accept_handle = Some(handle);
        Ok(())
    }

    /// Close the listener and every client socket, then join all threads.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Never served: dropping the listener closes it
        self.listener.take();

        if let Some(handle) = self.accept_handle.take() {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }

        let connections = std::mem::take(&mut *lock(&self.connections));
        for connection in &connections {
            let _ = connection.socket.shutdown(Shutdown::Both);
        }
        for connection in connections {
            if connection.handle.join().is_err() {
                warn!("Client handler for {} panicked", connection.peer);
            }
        }
        info!("Server on {} shut down", self.local_addr);
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        if self.accept_handle.is_some() || self.listener.is_some() {
            self.shutdown();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    stop: Arc<AtomicBool>,
    shared: Arc<SharedState>,
    queue: Arc<FrameQueue>,
    connections: Connections,
) {
    debug!("Accept loop started");
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Accepted {}", peer);
                if let Err(e) = spawn_client(stream, peer, &config, &shared, &queue, &connections) {
                    warn!("Could not serve {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(config.accept_poll()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // Per-connection failures such as ECONNABORTED; keep accepting
                warn!("Accept failed: {}", e);
                thread::sleep(config.accept_poll());
            }
        }
    }
    debug!("Accept loop stopped");
}

fn spawn_client(
    stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    shared: &Arc<SharedState>,
    queue: &Arc<FrameQueue>,
    connections: &Connections,
) -> std::io::Result<()> {
    let socket = stream.try_clone()?;
    let session = ClientSession::new(
        stream,
        peer,
        Arc::clone(shared),
        Arc::clone(queue),
        config,
    )?;
    let handle = thread::Builder::new()
        .name(format!("client-{peer}"))
        .spawn(move || session.run())?;

    let mut connections = lock(connections);
    reap_finished(&mut connections);
    connections.push(Connection {
        peer,
        socket,
        handle,
    });
    Ok(())
}

fn reap_finished(connections: &mut Vec<Connection>) {
    connections.retain(|c| !c.handle.is_finished());
}

fn lock(connections: &Connections) -> std::sync::MutexGuard<'_, Vec<Connection>> {
    connections
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
