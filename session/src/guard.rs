//! Gating of views and privileged operations on the session state

use crate::config::GuardConfig;
use crate::controller::SessionState;
use crate::role::RoleRequirement;

/// What to do with the guarded content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Session not settled yet, show a placeholder
    Loading,
    /// Nobody signed in, go to the sign in page
    Redirect { to: String },
    /// Signed in without the required role
    Denied { fallback: String },
    Render,
}

#[derive(Debug, Clone)]
pub struct RouteGuard {
    sign_in_path: String,
    fallback_path: String,
}

impl RouteGuard {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            sign_in_path: config.sign_in_path.clone(),
            fallback_path: config.fallback_path.clone(),
        }
    }

    pub fn check(&self, requirement: RoleRequirement, state: &SessionState) -> GuardDecision {
        match state {
            SessionState::Uninitialized | SessionState::Recovering => GuardDecision::Loading,
            SessionState::Anonymous => GuardDecision::Redirect {
                to: self.sign_in_path.clone(),
            },
            SessionState::Authenticated { role, .. } if !requirement.allows(*role) => {
                GuardDecision::Denied {
                    fallback: self.fallback_path.clone(),
                }
            }
            SessionState::Authenticated { .. } => GuardDecision::Render,
        }
    }
}

impl Default for RouteGuard {
    fn default() -> Self {
        Self::new(&GuardConfig::default())
    }
}
