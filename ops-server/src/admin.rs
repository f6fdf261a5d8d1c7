//! One-off administrative commands

use std::collections::HashMap;
use std::io::Write;

use color_eyre::Result;
use rtg_session::Role;
use serde::Deserialize;
use tracing::info;

use crate::model::Model;
use crate::model::roles::RoleRow;
use crate::model::users::{NewUser, User};

/// Seed file content
#[derive(Debug, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<SeedUser>,
}

#[derive(Debug, Deserialize)]
pub struct SeedUser {
    pub email: String,
    pub password: String,
    /// Role to assign, the row is left alone if missing
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default = "SeedUser::default_confirmed")]
    pub confirmed: bool,
}

impl SeedUser {
    fn default_confirmed() -> bool {
        true
    }
}

/// Creates or updates the seeded users, returns the number of processed users
pub async fn seed(model: &Model, seed: Seed) -> Result<usize> {
    let db = model.db();
    let count = seed.users.len();

    for SeedUser {
        email,
        password,
        role,
        confirmed,
    } in seed.users
    {
        let user_id = NewUser {
            email: email.clone(),
            password,
            confirmed,
        }
        .upsert(db)
        .await?;

        if let Some(role) = role {
            RoleRow::assign(db, user_id, role).await?;
        }

        info!(%email, %user_id, ?role, "User seeded");
    }

    Ok(count)
}

/// Writes all the users with their roles as a table
pub async fn inspect(model: &Model, out: &mut impl Write) -> Result<()> {
    let db = model.db();
    let users = User::all(db).await?;
    let roles: HashMap<_, _> = RoleRow::all(db)
        .await?
        .into_iter()
        .map(|row| (row.user_id, row))
        .collect();

    writeln!(out, "{:<36}  {:<32}  {:<9}  confirmed", "id", "email", "role")?;
    for user in users {
        let role = match roles.get(&user.id) {
            Some(row) => match row.role {
                Some(role) => role.0.to_string(),
                None => "(unset)".to_owned(),
            },
            None => "-".to_owned(),
        };

        writeln!(
            out,
            "{:<36}  {:<32}  {:<9}  {}",
            user.id, user.email, role, user.confirmed
        )?;
    }

    Ok(())
}

/// Assigns role to the user with the email
pub async fn set_role(model: &Model, email: &str, role: Role) -> Result<RoleRow> {
    let row = RoleRow::assign_by_email(model.db(), email, role).await?;
    info!(%email, %role, "Role assigned");
    Ok(row)
}
