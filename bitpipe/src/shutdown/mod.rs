// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Thin watcher for an external termination signal.
//!
//! [`ShutdownMonitor::register`] installs the process signal handlers;
//! [`ShutdownMonitor::monitor`] checks the observed flag at one-second
//! granularity and invokes a callback once, which is how the server's
//! graceful drain is usually triggered.

use std::{io, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::util::cancellation::CancellationListener;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Watches for SIGTERM (and ctrl-c) after [`ShutdownMonitor::register`].
pub struct ShutdownMonitor {
  triggered: CancellationToken,
  signal_task: JoinHandle<()>,
}

impl ShutdownMonitor {
  /// Install the termination signal handlers.
  ///
  /// Must be called from within a tokio runtime.
  pub fn register() -> io::Result<ShutdownMonitor> {
    let triggered = CancellationToken::new();
    let signal_task = spawn_signal_watcher(triggered.clone())?;
    Ok(ShutdownMonitor {
      triggered,
      signal_task,
    })
  }

  pub fn is_triggered(&self) -> bool {
    self.triggered.is_cancelled()
  }

  /// A listener view of the termination flag, for code that prefers awaiting
  /// over callbacks.
  pub fn listener(&self) -> CancellationListener {
    CancellationListener::from(self.triggered.child_token())
  }

  /// Spawn the periodic check; `callback` is invoked exactly once, after the
  /// termination signal has been observed.
  pub fn monitor<F>(&self, callback: F) -> JoinHandle<()>
  where
    F: FnOnce() + Send + 'static,
  {
    tokio::spawn(poll_trigger(self.listener(), callback))
  }
}

impl Drop for ShutdownMonitor {
  fn drop(&mut self) {
    self.signal_task.abort();
  }
}

#[cfg(unix)]
fn spawn_signal_watcher(triggered: CancellationToken) -> io::Result<JoinHandle<()>> {
  let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
  Ok(tokio::spawn(async move {
    tokio::select! {
      _ = sigterm.recv() => {}
      _ = tokio::signal::ctrl_c() => {}
    }
    tracing::trace!("termination signal detected");
    triggered.cancel();
  }))
}

#[cfg(not(unix))]
fn spawn_signal_watcher(triggered: CancellationToken) -> io::Result<JoinHandle<()>> {
  Ok(tokio::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    tracing::trace!("termination signal detected");
    triggered.cancel();
  }))
}

async fn poll_trigger<F: FnOnce()>(triggered: CancellationListener, callback: F) {
  let mut ticker = tokio::time::interval(POLL_INTERVAL);
  loop {
    ticker.tick().await;
    if triggered.is_cancelled() {
      tracing::debug!("termination signal observed; invoking shutdown callback");
      callback();
      break;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  #[tokio::test(start_paused = true)]
  async fn poll_trigger_fires_callback_once_after_signal() {
    let triggered = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let watcher = tokio::spawn(poll_trigger(CancellationListener::from(triggered.clone()), {
      let calls = Arc::clone(&calls);
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
      }
    }));

    // Several poll intervals pass without a signal.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    triggered.cancel();
    tokio::time::sleep(Duration::from_secs(2)).await;
    watcher.await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn listener_reflects_trigger_state() {
    let triggered = CancellationToken::new();
    let listener = CancellationListener::from(triggered.child_token());
    assert!(!listener.is_cancelled());
    triggered.cancel();
    assert!(listener.is_cancelled());
  }
}
