// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// Handed to workers that must *observe* teardown without being able to
/// request it themselves. Child tokens can still be produced from it for
/// sub-cancellation.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

#[cfg(test)]
mod tests {
  use super::CancellationListener;
  use tokio_util::sync::CancellationToken;

  #[test]
  fn listener_observes_parent_cancellation() {
    let token = CancellationToken::new();
    let listener = CancellationListener::from(token.child_token());
    assert!(!listener.is_cancelled());
    token.cancel();
    assert!(listener.is_cancelled());
  }

  #[test]
  fn default_listener_is_never_cancelled() {
    let listener = CancellationListener::default();
    assert!(!listener.is_cancelled());
  }
}
