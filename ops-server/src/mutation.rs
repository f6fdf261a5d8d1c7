//! Mutations main entry point

use async_graphql::Object;
use derivative::Derivative;

mod roles;

#[derive(Debug, Derivative)]
#[derivative(Default = "new")]
pub struct Mutation {
    /// Authorization table mutations
    roles: roles::RolesMutations,
}

#[Object]
impl Mutation {
    async fn roles(&self) -> &roles::RolesMutations {
        &self.roles
    }
}
