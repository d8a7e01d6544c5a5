//! kring error types.

use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KringError {
    /// `io_uring_setup` failed.
    Setup(i32),
    /// `io_uring_enter` failed.
    Enter(i32),
    /// Mapping ring memory failed.
    Mmap(i32),
    /// A kernel operation completed with a negative result.
    Os(i32),
    /// Ring geometry reported by the kernel failed validation.
    Layout(&'static str),
    /// Rejected configuration.
    InvalidConfig(&'static str),
}

impl KringError {
    /// The errno carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match *self {
            Self::Setup(e) | Self::Enter(e) | Self::Mmap(e) | Self::Os(e) => Some(e),
            Self::Layout(_) | Self::InvalidConfig(_) => None,
        }
    }
}

impl fmt::Display for KringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(e) => write!(f, "io_uring setup: {}", io::Error::from_raw_os_error(*e)),
            Self::Enter(e) => write!(f, "io_uring enter: {}", io::Error::from_raw_os_error(*e)),
            Self::Mmap(e) => write!(f, "ring mmap: {}", io::Error::from_raw_os_error(*e)),
            Self::Os(e) => write!(f, "{}", io::Error::from_raw_os_error(*e)),
            Self::Layout(msg) => write!(f, "ring layout: {}", msg),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for KringError {}

impl From<KringError> for io::Error {
    fn from(e: KringError) -> Self {
        match e.raw_os_error() {
            Some(errno) => io::Error::from_raw_os_error(errno),
            None => io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, KringError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_os_error() {
        assert_eq!(KringError::Setup(38).raw_os_error(), Some(38));
        assert_eq!(KringError::Os(9).raw_os_error(), Some(9));
        assert_eq!(KringError::InvalidConfig("x").raw_os_error(), None);
    }

    #[test]
    fn test_into_io_error() {
        // EBADF
        let e: io::Error = KringError::Os(9).into();
        assert_eq!(e.raw_os_error(), Some(9));

        let e: io::Error = KringError::InvalidConfig("bandwidth must be non-zero").into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidInput);
        assert!(e.to_string().contains("bandwidth"));
    }

    #[test]
    fn test_display_prefix() {
        assert!(KringError::Setup(1).to_string().starts_with("io_uring setup: "));
        assert!(KringError::Mmap(12).to_string().starts_with("ring mmap: "));
    }
}
