//! Session flow configuration

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "Recovery timeout ({recovery:?}) must exceed the role fetch timeout ({role_fetch:?}) by at least {margin:?}"
    )]
    RecoveryTimeoutTooShort {
        recovery: Duration,
        role_fetch: Duration,
        margin: Duration,
    },
    #[error("Session ttl can't be zero")]
    ZeroSessionTtl,
}

/// Minimal gap between the role fetch timeout and the recovery timeout
pub const TIMEOUT_MARGIN: Duration = Duration::from_millis(500);

/// What to do when the role lookup fails hard while recovering a persisted session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdStartRoleFailure {
    /// Continue with the `viewer` role, the same as on the listener path
    #[default]
    Fallback,
    /// Treat the recovered session as corrupted, purge it and become anonymous
    Purge,
}

/// Session controller configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Absolute session ceiling counted from the login
    pub session_ttl_secs: u64,

    /// Hard limit for the single role lookup
    pub role_fetch_timeout_ms: u64,

    /// Limit for reaching a definitive state after the start
    pub recovery_timeout_ms: u64,

    /// Policy for hard role lookup failures during cold start
    pub cold_start_role_failure: ColdStartRoleFailure,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 24 * 60 * 60,
            role_fetch_timeout_ms: 4_000,
            recovery_timeout_ms: 5_000,
            cold_start_role_failure: ColdStartRoleFailure::default(),
        }
    }
}

impl SessionConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn role_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.role_fetch_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Ensures the recovery timer can't fire before a role lookup had its chance to finish
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::ZeroSessionTtl);
        }

        if self.recovery_timeout() < self.role_fetch_timeout() + TIMEOUT_MARGIN {
            return Err(ConfigError::RecoveryTimeoutTooShort {
                recovery: self.recovery_timeout(),
                role_fetch: self.role_fetch_timeout(),
                margin: TIMEOUT_MARGIN,
            });
        }

        Ok(())
    }
}

/// Route guard targets
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Where anonymous users are sent
    pub sign_in_path: String,
    /// Safe page linked from the access denied view
    pub fallback_path: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            sign_in_path: "/login".to_owned(),
            fallback_path: "/".to_owned(),
        }
    }
}
