use std::fmt;

/// Errors surfaced by the heap and its page source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
  /// The page source could not supply an arena large enough for the request,
  /// or the request itself does not fit in the address space.
  OutOfMemory { requested: usize },
  /// A raw payload write would run past the end of the block.
  InsufficientCapacity { capacity: usize, required: usize },
  /// A [`HeapConfig`](crate::HeapConfig) value was rejected.
  InvalidConfig(&'static str),
  /// An OS memory call failed.
  Os { op: &'static str, errno: i32 },
}

impl HeapError {
  pub(crate) fn last_os_error(op: &'static str) -> Self {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    HeapError::Os { op, errno }
  }
}

impl fmt::Display for HeapError {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::OutOfMemory { requested } => write!(f, "out of memory (requested {} bytes)", requested),
      Self::InsufficientCapacity { capacity, required } => {
        write!(f, "write of {} bytes exceeds block capacity of {} bytes", required, capacity)
      }
      Self::InvalidConfig(reason) => write!(f, "invalid heap configuration: {}", reason),
      Self::Os { op, errno } => write!(f, "{} failed (errno {})", op, errno),
    }
  }
}

impl std::error::Error for HeapError {}

pub type Result<T> = std::result::Result<T, HeapError>;
