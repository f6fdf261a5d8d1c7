//! Role based access to the API operations

use async_graphql::{Context, Result};
use rtg_session::{AuthUser, GuardDecision, Role, RoleRequirement, RouteGuard, SessionState};
use tracing::debug;

use crate::model::Model;
use crate::model::auth::Session;
use crate::model::roles::RoleRow;
use crate::model::users::{User, UserId};

/// Authenticated caller of an operation
#[derive(Debug, Clone)]
pub struct Caller {
    pub user: User,
    pub role: Role,
}

impl Caller {
    pub fn id(&self) -> UserId {
        self.user.id
    }
}

/// Resolves the caller the same way clients do, missing and unset roles are `viewer`
async fn session_state(model: &Model, session: Option<&Session>) -> Result<(SessionState, Option<Caller>)> {
    let Some(session) = session else {
        return Ok((SessionState::Anonymous, None));
    };

    let db = model.db();
    let Some(user) = User::fetch(db, session.user_id).await? else {
        return Ok((SessionState::Anonymous, None));
    };

    let role = RoleRow::fetch(db, user.id)
        .await?
        .map(|row| row.effective_role())
        .unwrap_or_default();

    let state = SessionState::Authenticated {
        user: AuthUser {
            id: user.id.into(),
            email: user.email.clone(),
        },
        role,
    };

    Ok((state, Some(Caller { user, role })))
}

/// Checks the caller against the requirement
///
/// Anonymous callers get `Unauthorized`, callers without the required role get `Forbidden`.
pub async fn require(ctx: &Context<'_>, requirement: RoleRequirement) -> Result<Caller> {
    let model: &Model = ctx.data()?;
    let guard: &RouteGuard = ctx.data()?;
    let (state, caller) = session_state(model, ctx.data_opt::<Session>()).await?;

    match (guard.check(requirement, &state), caller) {
        (GuardDecision::Render, Some(caller)) => Ok(caller),
        (GuardDecision::Denied { .. }, _) => {
            debug!(?requirement, %state, "Operation denied");
            Err("Forbidden".into())
        }
        (GuardDecision::Render | GuardDecision::Redirect { .. } | GuardDecision::Loading, _) => {
            Err("Unauthorized".into())
        }
    }
}
