//! Persistent state of the backend

use std::path::PathBuf;

use color_eyre::Result;

pub mod auth;
pub mod roles;
pub mod users;

use async_graphql::EmptySubscription;
use rtg_session::{GuardConfig, RouteGuard};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tracing::debug;

use crate::config;
use crate::model::auth::{RefreshToken, Session};
use crate::model::users::{LoginError, User};
use crate::mutation::Mutation;
use crate::query::Query;
use crate::service::Schema;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Invalid SQLite path: {path}")]
    InvalidSQLitePath { path: PathBuf },
}

/// Tokens issued by a successful grant
#[derive(Debug, Clone)]
pub struct Grant {
    pub user: User,
    pub session: Session,
    pub refresh_token: RefreshToken,
}

/// Database and token settings shared by the handlers
#[derive(Clone)]
pub struct Model {
    /// Database access
    db: sqlx::SqlitePool,
    /// Issued tokens lifetimes
    tokens: config::Tokens,
}

impl Model {
    /// Model for testing purposes - using the in-memory SQLite database
    pub async fn test() -> Result<Self> {
        Self::with_config(config::Database::default(), config::Tokens::default()).await
    }

    /// Model from configuration
    ///
    /// If the database is created in-memory, the migrations are being executed automatically. If database is
    /// file based migrations would be executed only if requested by configuration.
    pub async fn with_config(config: config::Database, tokens: config::Tokens) -> Result<Self> {
        use config::Database::*;

        let db = match config {
            Memory { max_connections } => {
                let opts = SqliteConnectOptions::new()
                    .filename(":memory:")
                    .create_if_missing(true)
                    .foreign_keys(true)
                    .shared_cache(true);

                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_lazy_with(opts);

                sqlx::migrate!("model/migrations").run(&pool).await?;
                pool
            }

            SqLite {
                path,
                max_connections,
                migrate,
            } => {
                let path = path
                    .as_path()
                    .to_str()
                    .ok_or_else(|| Error::InvalidSQLitePath { path: path.clone() })?;

                let opts = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .foreign_keys(true);

                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_lazy_with(opts);

                if migrate {
                    sqlx::migrate!("model/migrations").run(&pool).await?;
                }

                pool
            }
        };

        Ok(Self { db, tokens })
    }

    /// Buids schema with attached context
    pub fn schema(&self) -> Schema {
        Schema::build(Query::new(), Mutation::new(), EmptySubscription)
            .data(self.clone())
            .data(RouteGuard::new(&GuardConfig::default()))
            .finish()
    }

    /// Accesses the DB pool
    pub fn db(&self) -> &sqlx::SqlitePool {
        &self.db
    }

    /// Exchanges email and password for tokens
    pub async fn password_grant(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Result<Grant, LoginError>> {
        match User::login(&self.db, email, password).await? {
            Ok(user) => self.issue(user).await.map(Ok),
            Err(err) => Ok(Err(err)),
        }
    }

    /// Exchanges refresh token for new tokens, `None` if the refresh token is not accepted
    pub async fn refresh_grant(&self, refresh_token: &RefreshToken) -> Result<Option<Grant>> {
        let user_id = match refresh_token.redeem(&self.db).await {
            Ok(user_id) => user_id,
            Err(err) => {
                debug!(%err, "Refresh token rejected");
                return Ok(None);
            }
        };

        match User::fetch(&self.db, user_id).await? {
            Some(user) => self.issue(user).await.map(Some),
            None => Ok(None),
        }
    }

    async fn issue(&self, user: User) -> Result<Grant> {
        let session = user
            .id
            .create_session(&self.db, self.tokens.access_ttl())
            .await?;
        let refresh_token = user
            .id
            .create_refresh_token(&self.db, self.tokens.refresh_ttl())
            .await?;

        Ok(Grant {
            user,
            session,
            refresh_token,
        })
    }

    /// Performs cleanup on the model
    pub async fn cleanup(&self) -> Result<()> {
        Session::cleanup(&self.db).await?;
        RefreshToken::cleanup(&self.db).await
    }
}
