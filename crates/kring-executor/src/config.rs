//! Service configuration.
//!
//! ```ignore
//! let service = ServiceBuilder::new()
//!     .bandwidth(1024)
//!     .build(InlineExecutor)?;
//!
//! // or: KRING_BANDWIDTH / KRING_SQ_ARRAY from the environment
//! let service = ServiceBuilder::from_env().build(InlineExecutor)?;
//! ```

use kring_core::env::{env_get, env_get_bool};
use kring_core::error::{KringError, Result};
use kring_core::executor::Executor;
use kring_module::sys::CQ_MAX_ENTRIES;

use crate::service::Service;

/// Default number of concurrently in-flight operations.
pub const DEFAULT_BANDWIDTH: u32 = 256;

#[derive(Debug, Clone)]
pub struct ServiceBuilder {
    /// Maximum operations in flight; sizes both rings.
    pub bandwidth: u32,
    /// Ask for `IORING_SETUP_NO_SQARRAY` (falls back automatically).
    pub no_sq_array: bool,
    /// Let the kernel clamp oversized rings instead of failing setup.
    pub clamp: bool,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self {
            bandwidth: DEFAULT_BANDWIDTH,
            no_sq_array: true,
            clamp: true,
        }
    }
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `KRING_BANDWIDTH` and `KRING_SQ_ARRAY=1`.
    pub fn from_env() -> Self {
        Self {
            bandwidth: env_get("KRING_BANDWIDTH", DEFAULT_BANDWIDTH),
            no_sq_array: !env_get_bool("KRING_SQ_ARRAY", false),
            ..Self::default()
        }
    }

    pub fn bandwidth(mut self, n: u32) -> Self {
        self.bandwidth = n;
        self
    }

    pub fn no_sq_array(mut self, on: bool) -> Self {
        self.no_sq_array = on;
        self
    }

    pub fn clamp(mut self, on: bool) -> Self {
        self.clamp = on;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.bandwidth == 0 {
            return Err("bandwidth must be non-zero");
        }
        if !self.clamp && self.bandwidth > CQ_MAX_ENTRIES {
            return Err("bandwidth exceeds the completion ring limit");
        }
        Ok(())
    }

    pub fn build<E: Executor>(self, executor: E) -> Result<Service<E>> {
        self.validate().map_err(KringError::InvalidConfig)?;
        Service::with_config(executor, &self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let b = ServiceBuilder::new();
        assert_eq!(b.bandwidth, DEFAULT_BANDWIDTH);
        assert!(b.no_sq_array);
        assert!(b.clamp);
        assert!(b.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            ServiceBuilder::new().bandwidth(0).validate(),
            Err("bandwidth must be non-zero")
        );
        assert!(ServiceBuilder::new().bandwidth(1 << 20).validate().is_ok());
        assert!(ServiceBuilder::new().bandwidth(1 << 20).clamp(false).validate().is_err());
    }

    #[test]
    fn test_build_rejects_zero_bandwidth() {
        let err = ServiceBuilder::new()
            .bandwidth(0)
            .build(kring_module::InlineExecutor)
            .err();
        assert_eq!(err, Some(KringError::InvalidConfig("bandwidth must be non-zero")));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("KRING_BANDWIDTH", "48");
        std::env::set_var("KRING_SQ_ARRAY", "1");
        let b = ServiceBuilder::from_env();
        std::env::remove_var("KRING_BANDWIDTH");
        std::env::remove_var("KRING_SQ_ARRAY");
        assert_eq!(b.bandwidth, 48);
        assert!(!b.no_sq_array);
    }
}
