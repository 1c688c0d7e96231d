use thiserror::Error;

/// Why an allocation could not be satisfied.
///
/// None of these are fatal to the process: the C surface maps them to a null
/// return (or an errno for `posix_memalign`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The page source refused to map more memory.
  #[error("out of memory: page source refused {bytes} bytes")]
  OutOfMemory { bytes: usize },
  /// A size computation overflowed `usize`.
  #[error("allocation size overflows usize")]
  Overflow,
  /// Alignment is not a power of two or cannot be honored.
  #[error("unsupported alignment {0}")]
  BadAlignment(usize),
  /// The reserved flat-table window has no contiguous room left.
  #[error("address window exhausted")]
  Exhausted,
}

impl AllocError {
  /// errno value used by the C surface.
  pub fn errno(self) -> i32 {
    match self {
      AllocError::BadAlignment(_) => libc::EINVAL,
      _ => libc::ENOMEM,
    }
  }
}

pub type Result<T> = core::result::Result<T, AllocError>;
