//! Identity provider accounts

use argon2::Argon2;
use async_graphql::{SimpleObject, scalar};
use chrono::{DateTime, Utc};
use color_eyre::eyre::{Result, eyre};
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use serde::{Deserialize, Serialize};
use sqlx::prelude::Type;
use thiserror::Error;
use uuid::Uuid;

use crate::model::auth::{RefreshToken, Session};

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Invalid user id format")]
    InvalidUserId,
}

/// Password grant rejection, messages are part of the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("Invalid login credentials")]
    InvalidCredentials,
    #[error("Email not confirmed")]
    EmailNotConfirmed,
}

/// Newtype for user id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct UserId(Uuid);

scalar!(UserId);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| Error::InvalidUserId)?;
        Ok(Self(id))
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<UserId> for rtg_session::UserId {
    fn from(id: UserId) -> Self {
        rtg_session::UserId::new(id.0)
    }
}

impl UserId {
    /// Fetches `User` with this id from database
    pub async fn fetch(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<Option<User>> {
        User::fetch(db, self).await
    }

    /// Creates a session for this user
    pub async fn create_session(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        ttl: std::time::Duration,
    ) -> Result<Session> {
        Session::create(db, self, ttl).await
    }

    /// Creates a refresh token for this user
    pub async fn create_refresh_token(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        ttl: std::time::Duration,
    ) -> Result<RefreshToken> {
        RefreshToken::create(db, self, ttl).await
    }
}

/// Hashes the password with argon2id
///
/// Hashing is CPU bound, it runs on the blocking pool.
pub async fn hash_password(password: &str) -> Result<String> {
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut password_hash::rand_core::OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| eyre!("Cannot hash password: {err}"))
    })
    .await?
}

/// Verifies the password against the stored PHC string, on the blocking pool
async fn verify_password(password: &str, hash: String) -> Result<bool> {
    let password = password.to_owned();
    let verified = tokio::task::spawn_blocking(move || match PasswordHash::new(&hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    })
    .await?;

    Ok(verified)
}

/// Account data
#[derive(Debug, Clone, PartialEq, SimpleObject)]
pub struct User {
    pub id: UserId,
    pub email: String,
    /// If the email address was confirmed
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Fetches user from the database
    pub async fn fetch(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
    ) -> Result<Option<Self>> {
        let row: Option<(UserId, String, bool, DateTime<Utc>)> = sqlx::query_as(
            "select id, email, confirmed, created_at from users where id = ?",
        )
        .bind(user_id)
        .fetch_optional(db)
        .await?;

        Ok(row.map(Self::from_row))
    }

    /// Finds user by the email
    pub async fn by_email(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        email: &str,
    ) -> Result<Option<Self>> {
        let row: Option<(UserId, String, bool, DateTime<Utc>)> = sqlx::query_as(
            "select id, email, confirmed, created_at from users where email = ?",
        )
        .bind(email)
        .fetch_optional(db)
        .await?;

        Ok(row.map(Self::from_row))
    }

    /// All users ordered by email
    pub async fn all(db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<Vec<Self>> {
        let rows: Vec<(UserId, String, bool, DateTime<Utc>)> = sqlx::query_as(
            "select id, email, confirmed, created_at from users order by email",
        )
        .fetch_all(db)
        .await?;

        Ok(rows.into_iter().map(Self::from_row).collect())
    }

    /// Checks the password grant credentials
    ///
    /// The outer error is a storage failure, the inner one is the rejection to report to the
    /// caller.
    pub async fn login(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        email: &str,
        password: &str,
    ) -> Result<Result<Self, LoginError>> {
        let row: Option<(UserId, String, bool, DateTime<Utc>, String)> = sqlx::query_as(
            "select id, email, confirmed, created_at, password_hash from users where email = ?",
        )
        .bind(email)
        .fetch_optional(db)
        .await?;

        let Some((id, email, confirmed, created_at, hash)) = row else {
            return Ok(Err(LoginError::InvalidCredentials));
        };

        if !verify_password(password, hash).await? {
            return Ok(Err(LoginError::InvalidCredentials));
        }

        if !confirmed {
            return Ok(Err(LoginError::EmailNotConfirmed));
        }

        Ok(Ok(Self::from_row((id, email, confirmed, created_at))))
    }

    fn from_row((id, email, confirmed, created_at): (UserId, String, bool, DateTime<Utc>)) -> Self {
        Self {
            id,
            email,
            confirmed,
            created_at,
        }
    }
}

/// Account to be created
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub confirmed: bool,
}

impl NewUser {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            confirmed: true,
        }
    }

    pub fn unconfirmed(mut self) -> Self {
        self.confirmed = false;
        self
    }

    /// Creates user in the database
    pub async fn create(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<UserId> {
        let user_id = UserId(Uuid::new_v4());
        let hash = hash_password(&self.password).await?;

        sqlx::query(
            "insert into users(id, email, password_hash, confirmed, created_at) values (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(self.email)
        .bind(hash)
        .bind(self.confirmed)
        .bind(Utc::now())
        .execute(db)
        .await?;

        Ok(user_id)
    }

    /// Creates the user or updates the password and confirmation of the existing one
    pub async fn upsert(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<UserId> {
        let hash = hash_password(&self.password).await?;

        let (user_id,): (UserId,) = sqlx::query_as(
            "insert into users(id, email, password_hash, confirmed, created_at) values (?, ?, ?, ?, ?)
             on conflict(email) do update set password_hash = excluded.password_hash, confirmed = excluded.confirmed
             returning id",
        )
        .bind(UserId(Uuid::new_v4()))
        .bind(self.email)
        .bind(hash)
        .bind(self.confirmed)
        .bind(Utc::now())
        .fetch_one(db)
        .await?;

        Ok(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("model/migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn users_empty_initially() {
        let pool = setup_pool().await;

        let (count,): (i64,) = sqlx::query_as("select count(*) from users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn creating_users() {
        let pool = setup_pool().await;

        let user1 = NewUser::new("user1@example.com", "secret1")
            .create(&pool)
            .await
            .unwrap();
        let fetched = user1.fetch(&pool).await.unwrap().unwrap();
        assert_eq!(fetched.id, user1);
        assert_eq!(fetched.email, "user1@example.com");
        assert!(fetched.confirmed);

        let user2 = NewUser::new("user2@example.com", "secret2")
            .unconfirmed()
            .create(&pool)
            .await
            .unwrap();
        assert_ne!(user1, user2);
        assert!(!user2.fetch(&pool).await.unwrap().unwrap().confirmed);

        // Emails are unique
        NewUser::new("user1@example.com", "other")
            .create(&pool)
            .await
            .unwrap_err();

        let emails: Vec<String> = User::all(&pool)
            .await
            .unwrap()
            .into_iter()
            .map(|user| user.email)
            .collect();
        assert_eq!(&emails, &["user1@example.com", "user2@example.com"]);
    }

    #[tokio::test]
    async fn passwords_are_hashed() {
        let pool = setup_pool().await;
        NewUser::new("user1@example.com", "secret1")
            .create(&pool)
            .await
            .unwrap();

        let (hash,): (String,) = sqlx::query_as("select password_hash from users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("secret1"));
    }

    #[tokio::test]
    async fn hashing_leaves_executor_free() {
        let mut ticks = 0;
        let ticker = async {
            loop {
                tokio::task::yield_now().await;
                ticks += 1;
            }
        };

        let hash = tokio::select! {
            hash = hash_password("secret1") => hash.unwrap(),
            _ = ticker => unreachable!(),
        };

        assert!(ticks > 0);
        assert!(verify_password("secret1", hash.clone()).await.unwrap());
        assert!(!verify_password("secret2", hash).await.unwrap());
    }

    #[tokio::test]
    async fn login() {
        let pool = setup_pool().await;
        let confirmed = NewUser::new("user1@example.com", "secret1")
            .create(&pool)
            .await
            .unwrap();
        NewUser::new("user2@example.com", "secret2")
            .unconfirmed()
            .create(&pool)
            .await
            .unwrap();

        let user = User::login(&pool, "user1@example.com", "secret1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.id, confirmed);

        assert_eq!(
            User::login(&pool, "user1@example.com", "secret2")
                .await
                .unwrap(),
            Err(LoginError::InvalidCredentials)
        );
        assert_eq!(
            User::login(&pool, "nobody@example.com", "secret1")
                .await
                .unwrap(),
            Err(LoginError::InvalidCredentials)
        );
        assert_eq!(
            User::login(&pool, "user2@example.com", "secret2")
                .await
                .unwrap(),
            Err(LoginError::EmailNotConfirmed)
        );
        // Wrong password never reveals the confirmation state
        assert_eq!(
            User::login(&pool, "user2@example.com", "secret1")
                .await
                .unwrap(),
            Err(LoginError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn upsert_keeps_id() {
        let pool = setup_pool().await;
        let created = NewUser::new("user1@example.com", "secret1")
            .unconfirmed()
            .create(&pool)
            .await
            .unwrap();

        let updated = NewUser::new("user1@example.com", "secret2")
            .upsert(&pool)
            .await
            .unwrap();
        assert_eq!(created, updated);

        let user = User::login(&pool, "user1@example.com", "secret2")
            .await
            .unwrap()
            .unwrap();
        assert!(user.confirmed);
    }
}
