// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! One-directional byte pump between two owned streams.
//!
//! A [`Pump`] takes ownership of an input and an output, copies bytes on a
//! dedicated worker until end-of-stream, then shuts down the write side of
//! the output and releases the input. I/O failure surfaces as a typed
//! [`PumpError`] from [`Pump::join`]; partial copies are never silently
//! tolerated.

use std::{io, time::Duration};

use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::util::cancellation::CancellationListener;

/// Copy granularity; one read never exceeds it.
pub const CHUNK_SIZE: usize = 8192;

/// Grace period for [`Pump::cancel_and_join`] before the worker is aborted.
const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum PumpError {
  #[error("failed to read from pump input")]
  Read(#[source] io::Error),
  #[error("failed to write to pump output")]
  Write(#[source] io::Error),
  #[error("failed to shut down pump output")]
  Shutdown(#[source] io::Error),
  #[error("pump worker was cancelled before reaching end of stream")]
  Cancelled,
}

/// Handle to a running byte-copy worker.
///
/// Both streams are owned by the worker from [`Pump::start`] onward; the
/// caller must not retain access to either. The handle is consumed by
/// exactly one of [`Pump::join`] or [`Pump::cancel_and_join`].
pub struct Pump {
  worker: JoinHandle<Result<u64, PumpError>>,
  cancel: CancellationToken,
}

impl Pump {
  /// Take ownership of both streams and start the copy worker.
  pub fn start<R, W>(input: R, output: W) -> Pump
  where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
  {
    let cancel = CancellationToken::new();
    let listener = CancellationListener::from(cancel.child_token());
    let worker = tokio::spawn(run_pump(input, output, listener));
    Pump { worker, cancel }
  }

  /// Wait for the worker to finish; returns the total bytes pumped.
  pub async fn join(self) -> Result<u64, PumpError> {
    flatten_join(self.worker.await)
  }

  /// Request early termination and wait for the worker to unwind.
  ///
  /// Cancellation is cooperative (observed between I/O attempts); if the
  /// worker does not yield within the grace period it is aborted outright,
  /// force-releasing both streams. Teardown only: the output's shutdown
  /// state is indeterminate afterwards.
  pub async fn cancel_and_join(mut self) -> Result<u64, PumpError> {
    self.cancel.cancel();
    match tokio::time::timeout(CANCEL_GRACE_PERIOD, &mut self.worker).await {
      Ok(join_result) => flatten_join(join_result),
      Err(_elapsed) => {
        self.worker.abort();
        flatten_join(self.worker.await)
      }
    }
  }
}

fn flatten_join(
  join_result: Result<Result<u64, PumpError>, tokio::task::JoinError>,
) -> Result<u64, PumpError> {
  match join_result {
    Ok(result) => result,
    Err(join_error) => {
      if join_error.is_panic() {
        std::panic::resume_unwind(join_error.into_panic());
      }
      Err(PumpError::Cancelled)
    }
  }
}

async fn run_pump<R, W>(
  mut input: R,
  mut output: W,
  cancel: CancellationListener,
) -> Result<u64, PumpError>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; CHUNK_SIZE];
  let mut pumped: u64 = 0;
  loop {
    let read = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(PumpError::Cancelled),
      read = input.read(&mut buf) => read,
    };
    let len = match read {
      Ok(0) => break,
      Ok(len) => len,
      Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
      Err(error) => return Err(PumpError::Read(error)),
    };
    output
      .write_all(&buf[..len])
      .await
      .map_err(PumpError::Write)?;
    pumped += len as u64;
  }

  // EOF: release the input, then perform a write-side shutdown of the
  // output. An output that does not support shutdown (not a socket) is
  // tolerated; any other failure is not.
  drop(input);
  match output.shutdown().await {
    Ok(()) => {}
    Err(error)
      if matches!(
        error.kind(),
        io::ErrorKind::Unsupported | io::ErrorKind::NotConnected
      ) => {}
    Err(error) => return Err(PumpError::Shutdown(error)),
  }
  tracing::debug!(pumped, "pump reached end of stream");
  Ok(pumped)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn pumps_input_to_output_then_signals_end_of_stream() {
    let (mut in_writer, in_reader) = duplex(64);
    let (out_writer, mut out_reader) = duplex(64);
    let pump = Pump::start(in_reader, out_writer);

    in_writer.write_all(b"hello").await.unwrap();
    drop(in_writer);

    // The output end must receive exactly the five bytes, then observe
    // end-of-stream from the pump's write-side shutdown.
    let mut collected = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), out_reader.read_to_end(&mut collected))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(collected, b"hello");

    let pumped = tokio::time::timeout(Duration::from_secs(2), pump.join())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(pumped, 5);
  }

  #[tokio::test]
  async fn preserves_chunk_order_across_multiple_writes() {
    let (mut in_writer, in_reader) = duplex(16);
    let (out_writer, mut out_reader) = duplex(16);
    let pump = Pump::start(in_reader, out_writer);

    let writer = tokio::spawn(async move {
      for chunk in [&b"first-"[..], &b"second-"[..], &b"third"[..]] {
        in_writer.write_all(chunk).await.unwrap();
        in_writer.flush().await.unwrap();
      }
      drop(in_writer);
    });

    let mut collected = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), out_reader.read_to_end(&mut collected))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(collected, b"first-second-third");
    writer.await.unwrap();
    assert_eq!(pump.join().await.unwrap(), 18);
  }

  #[tokio::test]
  async fn write_failure_is_reported_from_join() {
    let (mut in_writer, in_reader) = duplex(64);
    let (out_writer, out_reader) = duplex(64);
    // Closing the far end of the output makes the next write fail.
    drop(out_reader);
    let pump = Pump::start(in_reader, out_writer);

    in_writer.write_all(b"doomed").await.unwrap();
    drop(in_writer);

    let result = tokio::time::timeout(Duration::from_secs(2), pump.join())
      .await
      .unwrap();
    assert!(matches!(result, Err(PumpError::Write(_))));
  }

  #[tokio::test]
  async fn cancel_and_join_unblocks_an_idle_pump() {
    let (_in_writer, in_reader) = duplex(64);
    let (out_writer, _out_reader) = duplex(64);
    // No input ever arrives; the worker parks in its read.
    let pump = Pump::start(in_reader, out_writer);

    let result = tokio::time::timeout(Duration::from_secs(2), pump.cancel_and_join())
      .await
      .expect("cancellation must unblock the worker");
    assert!(matches!(result, Err(PumpError::Cancelled)));
  }

  #[tokio::test]
  async fn cancel_after_completion_returns_the_result() {
    let (mut in_writer, in_reader) = duplex(64);
    let (out_writer, mut out_reader) = duplex(64);
    let pump = Pump::start(in_reader, out_writer);

    in_writer.write_all(b"done").await.unwrap();
    drop(in_writer);
    let mut collected = Vec::new();
    out_reader.read_to_end(&mut collected).await.unwrap();

    // The worker already finished; cancellation must not clobber its result.
    let pumped = tokio::time::timeout(Duration::from_secs(2), pump.cancel_and_join())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(pumped, 4);
  }
}
