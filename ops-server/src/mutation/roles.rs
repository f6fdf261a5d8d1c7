//! Authorization table mutations

use async_graphql::{Context, Object, Result};
use rtg_session::RoleRequirement;
use tracing::{info, instrument};

use crate::access;
use crate::model::Model;
use crate::model::roles::{RoleName, RoleRow};
use crate::model::users::UserId;

#[derive(Debug, Default)]
pub struct RolesMutations;

#[Object]
impl RolesMutations {
    /// Creates the default `viewer` row for the caller, with the account email. Existing rows are
    /// returned unchanged.
    #[instrument(skip(self, ctx))]
    pub async fn bootstrap(&self, ctx: &Context<'_>, user_id: UserId) -> Result<RoleRow> {
        let caller = access::require(ctx, RoleRequirement::Any).await?;
        if caller.id() != user_id {
            return Err("Forbidden".into());
        }

        let model: &Model = ctx.data()?;
        let row = RoleRow::bootstrap(model.db(), user_id, &caller.user.email).await?;
        info!(?row, "Role row bootstrapped");

        Ok(row)
    }

    /// Assigns the role to the user
    #[instrument(skip(self, ctx))]
    pub async fn assign(
        &self,
        ctx: &Context<'_>,
        user_id: UserId,
        role: RoleName,
    ) -> Result<RoleRow> {
        let caller = access::require(ctx, RoleRequirement::AdminOnly).await?;

        let model: &Model = ctx.data()?;
        let row = RoleRow::assign(model.db(), user_id, role.0).await?;
        info!(by = %caller.user.email, ?row, "Role assigned");

        Ok(row)
    }
}
