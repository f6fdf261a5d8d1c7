//! Authorization table

use async_graphql::{SimpleObject, scalar};
use chrono::{DateTime, Utc};
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use rtg_session::Role;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::users::{User, UserId};

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("User {0} doesn't exist")]
    UnknownUser(UserId),
    #[error("User {0} doesn't exist")]
    UnknownEmail(String),
}

/// Role as exposed through the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleName(pub Role);

scalar!(RoleName, "Role");

impl From<Role> for RoleName {
    fn from(role: Role) -> Self {
        Self(role)
    }
}

type Row = (UserId, String, Option<String>, DateTime<Utc>);

/// Row of the authorization table
#[derive(Debug, Clone, PartialEq, SimpleObject)]
pub struct RoleRow {
    pub user_id: UserId,
    pub email: String,
    /// Unset roles are treated as `viewer` by the clients
    pub role: Option<RoleName>,
    pub created_at: DateTime<Utc>,
}

impl RoleRow {
    fn from_row((user_id, email, role, created_at): Row) -> Result<Self> {
        let role = role.map(|role| role.parse().map(RoleName)).transpose()?;

        Ok(Self {
            user_id,
            email,
            role,
            created_at,
        })
    }

    /// Role the row grants, `viewer` if unset
    pub fn effective_role(&self) -> Role {
        self.role.map(|RoleName(role)| role).unwrap_or_default()
    }

    /// Fetches the row of the user
    pub async fn fetch(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
    ) -> Result<Option<Self>> {
        let row: Option<Row> = sqlx::query_as(
            "select user_id, email, role, created_at from user_roles where user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(db)
        .await?;

        row.map(Self::from_row).transpose()
    }

    /// All rows ordered by email
    pub async fn all(db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<Vec<Self>> {
        let rows: Vec<Row> = sqlx::query_as(
            "select user_id, email, role, created_at from user_roles order by email",
        )
        .fetch_all(db)
        .await?;

        rows.into_iter().map(Self::from_row).collect()
    }

    /// Creates the default `viewer` row, existing rows are left untouched
    pub async fn bootstrap(db: &sqlx::SqlitePool, user_id: UserId, email: &str) -> Result<Self> {
        sqlx::query(
            "insert into user_roles (user_id, email, role, created_at) values (?, ?, ?, ?)
             on conflict(user_id) do nothing",
        )
        .bind(user_id)
        .bind(email)
        .bind(Role::Viewer.as_str())
        .bind(Utc::now())
        .execute(db)
        .await?;

        Self::fetch(db, user_id)
            .await?
            .ok_or_eyre(Error::UnknownUser(user_id))
    }

    /// Sets the user role, creating the row if needed
    pub async fn assign(db: &sqlx::SqlitePool, user_id: UserId, role: Role) -> Result<Self> {
        let user = User::fetch(db, user_id)
            .await?
            .ok_or_eyre(Error::UnknownUser(user_id))?;

        let row: Row = sqlx::query_as(
            "insert into user_roles (user_id, email, role, created_at) values (?, ?, ?, ?)
             on conflict(user_id) do update set role = excluded.role, email = excluded.email
             returning user_id, email, role, created_at",
        )
        .bind(user_id)
        .bind(user.email)
        .bind(role.as_str())
        .bind(Utc::now())
        .fetch_one(db)
        .await?;

        Self::from_row(row)
    }

    /// Sets the role of the user with the email
    pub async fn assign_by_email(db: &sqlx::SqlitePool, email: &str, role: Role) -> Result<Self> {
        let user = User::by_email(db, email)
            .await?
            .ok_or_else(|| Error::UnknownEmail(email.to_owned()))?;

        Self::assign(db, user.id, role).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::users::NewUser;
    use sqlx::SqlitePool;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("model/migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn missing_row() {
        let pool = setup_pool().await;
        let user = NewUser::new("user1@example.com", "secret")
            .create(&pool)
            .await
            .unwrap();

        assert_eq!(RoleRow::fetch(&pool, user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let pool = setup_pool().await;
        let user = NewUser::new("user1@example.com", "secret")
            .create(&pool)
            .await
            .unwrap();

        let first = RoleRow::bootstrap(&pool, user, "user1@example.com")
            .await
            .unwrap();
        let second = RoleRow::bootstrap(&pool, user, "user1@example.com")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.role, Some(RoleName(Role::Viewer)));
        assert_eq!(RoleRow::all(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_keeps_assigned_role() {
        let pool = setup_pool().await;
        let user = NewUser::new("user1@example.com", "secret")
            .create(&pool)
            .await
            .unwrap();

        RoleRow::assign(&pool, user, Role::Admin).await.unwrap();
        let row = RoleRow::bootstrap(&pool, user, "user1@example.com")
            .await
            .unwrap();

        assert_eq!(row.effective_role(), Role::Admin);
    }

    #[tokio::test]
    async fn assign_overwrites() {
        let pool = setup_pool().await;
        let user = NewUser::new("user1@example.com", "secret")
            .create(&pool)
            .await
            .unwrap();

        let row = RoleRow::assign(&pool, user, Role::Operator).await.unwrap();
        assert_eq!(row.effective_role(), Role::Operator);

        let row = RoleRow::assign_by_email(&pool, "user1@example.com", Role::Admin)
            .await
            .unwrap();
        assert_eq!(row.effective_role(), Role::Admin);
        assert_eq!(
            RoleRow::fetch(&pool, user).await.unwrap().unwrap().role,
            Some(RoleName(Role::Admin))
        );

        RoleRow::assign_by_email(&pool, "nobody@example.com", Role::Admin)
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn null_role_is_viewer() {
        let pool = setup_pool().await;
        let user = NewUser::new("user1@example.com", "secret")
            .create(&pool)
            .await
            .unwrap();

        sqlx::query("insert into user_roles (user_id, email, role, created_at) values (?, ?, null, ?)")
            .bind(user)
            .bind("user1@example.com")
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();

        let row = RoleRow::fetch(&pool, user).await.unwrap().unwrap();
        assert_eq!(row.role, None);
        assert_eq!(row.effective_role(), Role::Viewer);
    }

    #[tokio::test]
    async fn unknown_roles_are_rejected_by_the_table() {
        let pool = setup_pool().await;

        sqlx::query("insert into user_roles (user_id, email, role, created_at) values (?, ?, 'root', ?)")
            .bind(UserId::from(uuid::Uuid::new_v4()))
            .bind("user1@example.com")
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap_err();
    }
}
