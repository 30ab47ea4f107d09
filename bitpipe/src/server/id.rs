#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
  pub fn new(inner: u64) -> ConnectionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for ConnectionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<ConnectionId> for u64 {
  fn from(id: ConnectionId) -> u64 {
    id.inner()
  }
}

pub struct MonotonicAtomicGenerator {
  next: std::sync::atomic::AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: std::sync::atomic::AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> ConnectionId {
    ConnectionId::new(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
  }
}

impl std::fmt::Debug for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionId")
      .field("inner", &self.inner())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::MonotonicAtomicGenerator;

  #[test]
  fn generator_is_monotonic() {
    let generator = MonotonicAtomicGenerator::new(1);
    let first = generator.next();
    let second = generator.next();
    assert!(first < second);
  }
}
