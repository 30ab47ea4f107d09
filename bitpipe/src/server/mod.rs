// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A TCP server with a fixed concurrency budget.
//!
//! [`Server`] accepts connections only while the live set is below
//! `max_connections`; backpressure is applied by simply not accepting, never
//! by admitting and then rejecting. Every completed read is handed to the
//! caller's [`MessageHandler`], and each connection exits through a single
//! drop path which frees capacity and completes a pending graceful drain.

use std::{
  io,
  net::{IpAddr, Ipv4Addr, SocketAddr},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::{
  io::AsyncReadExt,
  net::{TcpListener, TcpStream},
  sync::Notify,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

pub mod id;

use id::{ConnectionId, MonotonicAtomicGenerator};

/// Read buffer length per connection; one handler delivery never exceeds it.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

#[derive(thiserror::Error, Debug)]
#[error("message handler failure: {0}")]
pub struct HandlerError(#[from] pub anyhow::Error);

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
  #[error("failed to bind listener on {addr}")]
  Bind {
    addr: SocketAddr,
    #[source]
    source: io::Error,
  },
  #[error("failed to inspect listening socket")]
  Listener(#[source] io::Error),
  #[error("accept failed on listening socket")]
  Accept(#[source] io::Error),
  #[error("connection read failed")]
  ConnectionRead(#[source] io::Error),
  #[error("server run loop was already started")]
  AlreadyRunning,
}

/// Receives the raw bytes of every completed read, per connection, in order.
///
/// No framing is applied: a delivery is exactly the byte range one read
/// completion produced. Handlers run inline between reads on a connection,
/// so the next read is not re-armed until the returned future resolves.
pub trait MessageHandler: Send + Sync {
  fn handle_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<(), HandlerError>>;
}

impl<T: MessageHandler + ?Sized> MessageHandler for Arc<T> {
  fn handle_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<(), HandlerError>> {
    T::handle_message(self.as_ref(), message)
  }
}

/// What to do with a connection whose handler reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerErrorPolicy {
  /// Log and re-arm the next read regardless; the handler cannot end the
  /// connection from inside the callback.
  #[default]
  Ignore,
  /// Treat handler failure as the end of the connection and drop it.
  DropConnection,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub bind_addr: SocketAddr,
  pub max_connections: usize,
  pub handler_error_policy: HandlerErrorPolicy,
  pub read_buffer_size: usize,
}

impl ServerConfig {
  pub fn new(bind_addr: SocketAddr, max_connections: usize) -> Self {
    Self {
      bind_addr,
      max_connections,
      handler_error_policy: HandlerErrorPolicy::default(),
      read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
    }
  }

  /// Listen on the IPv4 wildcard address for `port`.
  pub fn wildcard(port: u16, max_connections: usize) -> Self {
    Self::new(
      SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
      max_connections,
    )
  }
}

struct ConnectionHandle {
  peer_addr: SocketAddr,
  cancel: CancellationToken,
}

struct ServerInner<H> {
  listener: Mutex<Option<TcpListener>>,
  local_addr: SocketAddr,
  max_connections: usize,
  read_buffer_size: usize,
  handler_error_policy: HandlerErrorPolicy,
  handler: H,
  connections: DashMap<ConnectionId, ConnectionHandle>,
  id_generator: MonotonicAtomicGenerator,
  /// Pinged by the drop path whenever the live set shrinks.
  capacity_freed: Notify,
  /// Monotone false-to-true once a drain (graceful or forced) has begun.
  draining: AtomicBool,
  /// Cancelled to retire the accept loop; no connection is admitted after it.
  accept_halt: CancellationToken,
  /// Cancelled exactly once: on a fatal error, or when a drain empties the
  /// live set. [`Server::run`] terminates on it.
  done: CancellationToken,
  fatal: Mutex<Option<ServerError>>,
}

impl<H> ServerInner<H> {
  /// Record a fatal error and halt the server. Only the first error is kept.
  ///
  /// Nothing may be accepted, read, or delivered after a fatal exit, so every
  /// surviving connection is cancelled and unwinds through the drop path.
  fn fail(&self, error: ServerError) {
    {
      let mut slot = self.fatal.lock().expect("fatal error slot poisoned");
      if slot.is_none() {
        tracing::error!(%error, "fatal server error");
        *slot = Some(error);
      }
    }
    self.accept_halt.cancel();
    for entry in self.connections.iter() {
      entry.value().cancel.cancel();
    }
    self.done.cancel();
  }

  /// The single choke point through which every connection exits.
  ///
  /// Unlinks the record, frees capacity for the accept loop, and completes a
  /// pending drain when the live set empties. Safe against duplicate calls:
  /// the keyed removal succeeds at most once.
  fn drop_connection(&self, id: ConnectionId) {
    let removed = match self.connections.remove(&id) {
      Some((_, handle)) => handle,
      None => return,
    };
    tracing::debug!(
      ?id,
      peer_addr = ?removed.peer_addr,
      live = self.connections.len(),
      "connection dropped"
    );
    if self.draining.load(Ordering::SeqCst) && self.connections.is_empty() {
      self.done.cancel();
    }
    self.capacity_freed.notify_waiters();
  }
}

/// A bounded-concurrency TCP message server.
///
/// Created by [`Server::bind`], driven by [`Server::run`], and torn down by
/// [`Server::request_shutdown`] (graceful drain) or [`Server::shutdown`]
/// (immediate). Wrap it in an [`Arc`] to trigger shutdown from another task.
pub struct Server<H> {
  inner: Arc<ServerInner<H>>,
}

impl<H> Server<H>
where
  H: MessageHandler + 'static,
{
  /// Bind a listening socket and construct the server around it.
  ///
  /// No accept is attempted until [`Server::run`]; failure leaves no live
  /// state behind.
  pub async fn bind(config: ServerConfig, handler: H) -> Result<Server<H>, ServerError> {
    let listener = TcpListener::bind(config.bind_addr)
      .await
      .map_err(|source| ServerError::Bind {
        addr: config.bind_addr,
        source,
      })?;
    let local_addr = listener.local_addr().map_err(ServerError::Listener)?;
    tracing::info!(
      %local_addr,
      max_connections = config.max_connections,
      "listener bound"
    );
    Ok(Server {
      inner: Arc::new(ServerInner {
        listener: Mutex::new(Some(listener)),
        local_addr,
        max_connections: config.max_connections,
        read_buffer_size: config.read_buffer_size,
        handler_error_policy: config.handler_error_policy,
        handler,
        connections: DashMap::new(),
        id_generator: MonotonicAtomicGenerator::new(1),
        capacity_freed: Notify::new(),
        draining: AtomicBool::new(false),
        accept_halt: CancellationToken::new(),
        done: CancellationToken::new(),
        fatal: Mutex::new(None),
      }),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.inner.local_addr
  }

  /// Number of accepted, not-yet-dropped connections.
  pub fn live_connections(&self) -> usize {
    self.inner.connections.len()
  }

  /// Accept and serve connections until a drain completes or a fatal error
  /// occurs, surfacing the error in the latter case.
  ///
  /// The accept loop is the sole admitter: at most one accept is outstanding
  /// at any time, and none while the live set is at capacity.
  pub async fn run(&self) -> Result<(), ServerError> {
    let listener = self
      .inner
      .listener
      .lock()
      .expect("listener slot poisoned")
      .take()
      .ok_or(ServerError::AlreadyRunning)?;
    let inner = &self.inner;

    'accept: loop {
      // Capacity gate. The notified future is created before the check so a
      // drop occurring between the check and the await cannot be missed.
      loop {
        let freed = inner.capacity_freed.notified();
        if inner.accept_halt.is_cancelled() {
          break 'accept;
        }
        if inner.connections.len() < inner.max_connections {
          break;
        }
        tokio::select! {
          _ = inner.accept_halt.cancelled() => break 'accept,
          _ = freed => {}
        }
      }

      tokio::select! {
        biased;
        _ = inner.accept_halt.cancelled() => break 'accept,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer_addr)) => {
            if inner.accept_halt.is_cancelled() {
              // Raced a shutdown request; the connection is not admitted.
              break 'accept;
            }
            self.register_connection(stream, peer_addr);
          }
          Err(error) => {
            // A failed accept on the listening socket is fatal.
            inner.fail(ServerError::Accept(error));
            break 'accept;
          }
        },
      }
    }

    // Drain phase: hold the listener open until the live set empties or a
    // fatal error ends the run early.
    inner.done.cancelled().await;
    drop(listener);

    match inner.fatal.lock().expect("fatal error slot poisoned").take() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }

  fn register_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
    let id = self.inner.id_generator.next();
    let cancel = CancellationToken::new();
    self.inner.connections.insert(
      id,
      ConnectionHandle {
        peer_addr,
        cancel: cancel.clone(),
      },
    );
    tracing::debug!(
      ?id,
      %peer_addr,
      live = self.inner.connections.len(),
      "connection accepted"
    );
    let span = tracing::debug_span!("connection", ?id, %peer_addr);
    let inner = Arc::clone(&self.inner);
    tokio::spawn(async move {
      let worker =
        tokio::spawn(serve_connection(Arc::clone(&inner), id, stream, cancel).instrument(span));
      // The record must be released on every exit, a panicking handler
      // included, or its capacity is consumed forever and drains never finish.
      if let Err(join_error) = worker.await {
        if join_error.is_panic() {
          tracing::error!(?id, "connection task panicked");
        }
      }
      inner.drop_connection(id);
    });
  }

  /// Begin a graceful drain: stop accepting, let live connections finish
  /// naturally, and complete [`Server::run`] once the last one drops.
  ///
  /// Idempotent; if nothing is live the run loop completes immediately.
  pub fn request_shutdown(&self) {
    let inner = &self.inner;
    inner.draining.store(true, Ordering::SeqCst);
    inner.accept_halt.cancel();
    tracing::info!(live = inner.connections.len(), "graceful shutdown requested");
    if inner.connections.is_empty() {
      inner.done.cancel();
    }
  }

  /// Immediate, terminal shutdown: force-drop every remaining connection
  /// through the regular drop path, wait for the tasks to unwind, and close
  /// the listening socket.
  ///
  /// Safe to call whether or not a graceful drain was requested and whether
  /// or not [`Server::run`] exited normally.
  pub async fn shutdown(&self) {
    let inner = &self.inner;
    inner.draining.store(true, Ordering::SeqCst);
    inner.accept_halt.cancel();
    for entry in inner.connections.iter() {
      entry.value().cancel.cancel();
    }
    loop {
      let freed = inner.capacity_freed.notified();
      if inner.connections.is_empty() {
        break;
      }
      freed.await;
    }
    inner.done.cancel();
    drop(inner.listener.lock().expect("listener slot poisoned").take());
    tracing::info!("server shut down");
  }
}

/// Per-connection read loop: exactly one read outstanding at a time, each
/// completed read delivered before the next is armed. The spawning wrapper
/// funnels every exit, panics included, into [`ServerInner::drop_connection`].
async fn serve_connection<H: MessageHandler + 'static>(
  inner: Arc<ServerInner<H>>,
  id: ConnectionId,
  mut stream: TcpStream,
  cancel: CancellationToken,
) {
  let mut buf = vec![0u8; inner.read_buffer_size];
  loop {
    let read = tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      read = stream.read(&mut buf) => read,
    };
    match read {
      Ok(0) => break,
      Ok(len) => {
        if let Err(error) = inner.handler.handle_message(&buf[..len]).await {
          match inner.handler_error_policy {
            HandlerErrorPolicy::Ignore => {
              tracing::warn!(?id, %error, "message handler failed; connection kept open");
            }
            HandlerErrorPolicy::DropConnection => {
              tracing::debug!(?id, %error, "message handler failed; dropping connection");
              break;
            }
          }
        }
      }
      Err(error) => {
        // Read errors are fatal for the whole server, matching accept
        // failures; EOF alone ends a connection quietly.
        inner.fail(ServerError::ConnectionRead(error));
        break;
      }
    }
  }
}
