//! Main query entry point

use async_graphql::{Context, Object, Result, SimpleObject};
use derivative::Derivative;
use rtg_session::RoleRequirement;
use tracing::instrument;

mod roles;

use crate::access;
use crate::model::roles::RoleName;
use crate::model::users::UserId;

/// Authenticated user with the resolved role
#[derive(Debug, Clone, SimpleObject)]
pub struct Me {
    pub id: UserId,
    pub email: String,
    pub role: RoleName,
}

#[derive(Debug, Derivative)]
#[derivative(Default = "new")]
pub struct Query {
    /// Authorization table queries
    roles: roles::RolesQueries,
}

#[Object]
impl Query {
    /// Currently authenticated user
    #[instrument(skip(self, ctx))]
    async fn me(&self, ctx: &Context<'_>) -> Result<Me> {
        let caller = access::require(ctx, RoleRequirement::Any).await?;

        Ok(Me {
            id: caller.user.id,
            email: caller.user.email,
            role: caller.role.into(),
        })
    }

    async fn roles(&self) -> &roles::RolesQueries {
        &self.roles
    }
}
