//! Authorization table queries

use async_graphql::{Context, Object, Result};
use rtg_session::RoleRequirement;
use tracing::instrument;

use crate::access;
use crate::model::Model;
use crate::model::roles::RoleRow;
use crate::model::users::UserId;

#[derive(Debug, Default)]
pub struct RolesQueries;

#[Object]
impl RolesQueries {
    /// Role row of the user, `null` if there is none yet
    ///
    /// Users can read their own row only, unless they are admins.
    #[instrument(skip(self, ctx))]
    async fn role(&self, ctx: &Context<'_>, user_id: UserId) -> Result<Option<RoleRow>> {
        let caller = access::require(ctx, RoleRequirement::Any).await?;
        if caller.id() != user_id {
            access::require(ctx, RoleRequirement::AdminOnly).await?;
        }

        let model: &Model = ctx.data()?;
        Ok(RoleRow::fetch(model.db(), user_id).await?)
    }

    /// Whole authorization table
    #[instrument(skip(self, ctx))]
    async fn all(&self, ctx: &Context<'_>) -> Result<Vec<RoleRow>> {
        access::require(ctx, RoleRequirement::AdminOnly).await?;

        let model: &Model = ctx.data()?;
        Ok(RoleRow::all(model.db()).await?)
    }
}
