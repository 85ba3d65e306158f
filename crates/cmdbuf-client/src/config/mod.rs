//! Client configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables (runtime)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use cmdbuf_client::config::HelperConfig;
//!
//! let config = HelperConfig::from_env()
//!     .ring_entries(4096)
//!     .wait_deadline(Some(Duration::from_secs(2)));
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use cmdbuf_core::env::{env_get, env_get_str};
use cmdbuf_core::{CmdBufError, CmdBufResult};

/// Helper and transfer-arena configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// Ring size in entries
    pub ring_entries: u32,
    /// Transfer arena size in bytes
    pub transfer_size: u32,
    /// Give up blocking waits after this long (`None` = never)
    pub wait_deadline: Option<Duration>,
    /// Name for shared memory objects
    pub shm_name: String,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl HelperConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CMDBUF_RING_ENTRIES` - Ring size in entries
    /// - `CMDBUF_TRANSFER_SIZE` - Transfer arena size in bytes
    /// - `CMDBUF_WAIT_DEADLINE_MS` - Wait deadline in milliseconds (0 = none)
    /// - `CMDBUF_SHM_NAME` - Shared memory object name
    pub fn from_env() -> Self {
        let deadline_ms = env_get("CMDBUF_WAIT_DEADLINE_MS", defaults::WAIT_DEADLINE_MS);
        Self {
            ring_entries: env_get("CMDBUF_RING_ENTRIES", defaults::RING_ENTRIES),
            transfer_size: env_get("CMDBUF_TRANSFER_SIZE", defaults::TRANSFER_SIZE),
            wait_deadline: deadline_from_ms(deadline_ms),
            shm_name: env_get_str("CMDBUF_SHM_NAME", defaults::SHM_NAME),
        }
    }

    /// Create config with explicit defaults (no env override).
    pub fn new() -> Self {
        Self {
            ring_entries: defaults::RING_ENTRIES,
            transfer_size: defaults::TRANSFER_SIZE,
            wait_deadline: deadline_from_ms(defaults::WAIT_DEADLINE_MS),
            shm_name: defaults::SHM_NAME.to_string(),
        }
    }

    // Builder methods

    pub fn ring_entries(mut self, n: u32) -> Self {
        self.ring_entries = n;
        self
    }

    pub fn transfer_size(mut self, bytes: u32) -> Self {
        self.transfer_size = bytes;
        self
    }

    pub fn wait_deadline(mut self, d: Option<Duration>) -> Self {
        self.wait_deadline = d;
        self
    }

    pub fn shm_name(mut self, name: impl Into<String>) -> Self {
        self.shm_name = name.into();
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> CmdBufResult<()> {
        if self.ring_entries < 2 {
            return Err(CmdBufError::InvalidConfig("ring_entries must be >= 2"));
        }
        if self.ring_entries > defaults::MAX_RING_ENTRIES {
            return Err(CmdBufError::InvalidConfig("ring_entries must be <= 2^24"));
        }
        if self.transfer_size == 0 {
            return Err(CmdBufError::InvalidConfig("transfer_size must be > 0"));
        }
        if self.transfer_size == u32::MAX {
            return Err(CmdBufError::InvalidConfig("transfer_size must be < u32::MAX"));
        }
        if self.wait_deadline == Some(Duration::ZERO) {
            return Err(CmdBufError::InvalidConfig("wait_deadline must be non-zero"));
        }
        if self.shm_name.is_empty() || self.shm_name.contains(['/', '\0']) {
            return Err(CmdBufError::InvalidConfig("shm_name must be a plain non-empty name"));
        }
        Ok(())
    }

    /// Log configuration at info level
    pub fn log(&self) {
        log::info!("cmdbuf configuration:");
        log::info!("  ring_entries:   {}", self.ring_entries);
        log::info!("  transfer_size:  {}", self.transfer_size);
        log::info!("  wait_deadline:  {:?}", self.wait_deadline);
        log::info!("  shm_name:       {}", self.shm_name);
    }
}

fn deadline_from_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HelperConfig::new();
        assert_eq!(config.ring_entries, defaults::RING_ENTRIES);
        assert_eq!(config.wait_deadline, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("CMDBUF_RING_ENTRIES", "256");
        std::env::set_var("CMDBUF_WAIT_DEADLINE_MS", "1500");
        let config = HelperConfig::from_env();
        std::env::remove_var("CMDBUF_RING_ENTRIES");
        std::env::remove_var("CMDBUF_WAIT_DEADLINE_MS");

        assert_eq!(config.ring_entries, 256);
        assert_eq!(config.wait_deadline, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_builder() {
        let config = HelperConfig::new()
            .ring_entries(64)
            .transfer_size(4096)
            .wait_deadline(Some(Duration::from_millis(5)))
            .shm_name("ring-test");

        assert_eq!(config.ring_entries, 64);
        assert_eq!(config.transfer_size, 4096);
        assert_eq!(config.wait_deadline, Some(Duration::from_millis(5)));
        assert_eq!(config.shm_name, "ring-test");
    }

    #[test]
    fn test_validation() {
        assert!(HelperConfig::new().ring_entries(1).validate().is_err());
        assert!(HelperConfig::new().ring_entries(1 << 25).validate().is_err());
        assert!(HelperConfig::new().transfer_size(0).validate().is_err());
        assert!(HelperConfig::new().wait_deadline(Some(Duration::ZERO)).validate().is_err());
        assert!(matches!(
            HelperConfig::new().shm_name("a/b").validate(),
            Err(CmdBufError::InvalidConfig(_))
        ));
    }
}
