//! Access and refresh tokens

use std::str::FromStr;
use std::time::Duration;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, bail, ensure};
use pasetors::claims::{Claims, ClaimsValidationRules};
use pasetors::footer::Footer;
use pasetors::keys::{AsymmetricKeyPair, AsymmetricPublicKey, Generate};
use pasetors::paserk::{self, FormatAsPaserk};
use pasetors::token::UntrustedToken;
use pasetors::version4::V4;
use pasetors::{Public, public};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use thiserror::Error;
use uuid::Uuid;

use crate::model::users::UserId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid token format")]
    InvalidTokenFormat,
    #[error("Token doesn't exist")]
    NonExistingToken,
    #[error("Token expired")]
    ExpiredToken,
    #[error("Missing user id on a token")]
    MissingUserId,
    #[error("Missing token id on a token")]
    MissingTokenId,
    #[error("Missing session data")]
    MissingClaims,
    #[error("Signature malformed in the database")]
    InvalidSignatureStored,
    #[error("Invalid session claim {0}")]
    InvalidSessionClaim(&'static str),
    #[error("Token ID collision")]
    TokenIdCollision,
    #[error("Invalid authorization format")]
    InvalidAuthorization,
    #[error("Invalid authorization scheme")]
    InvalidAuthorizationScheme,
}

/// Secret mixed into the refresh token signatures. It should be fed from the environment
/// during the build.
const REFRESH_TOKEN_APP_SECRET: &str = "RtgOpsRefreshTokenSecret";

/// PASETO implicit assertion for access tokens
const SESSION_APP_SECRET: &[u8] = b"RtgOpsAccessTokenSecret";

/// Parsed `Authorization: Bearer [token]` header
#[derive(Debug, Clone)]
pub struct Bearer(pub SessionToken);

impl FromStr for Bearer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, token) = s.split_once(' ').ok_or(Error::InvalidAuthorization)?;

        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(Error::InvalidAuthorizationScheme);
        }

        Ok(Self(SessionToken(token.trim().to_owned())))
    }
}

/// Newtype for the refresh token string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshToken(String);

impl std::fmt::Display for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RefreshToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl RefreshToken {
    /// Creates new refresh token for an user storing it in the database
    pub async fn create(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
        ttl: Duration,
    ) -> Result<Self> {
        let (user_token, token) = UserToken::generate(user_id);

        let token_id = Uuid::new_v4();
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl)?;

        let insertion = sqlx::query(
                "insert into refresh_tokens (id, user_id, secret, signature, expires_at) values (?, ?, ?, ?, ?) on conflict(id) do nothing",
            )
            .bind(token_id)
            .bind(user_id)
            .bind(user_token.secret)
            .bind(user_token.signature.as_slice())
            .bind(expires_at)
            .execute(db)
            .await?;

        if insertion.rows_affected() == 0 {
            bail!(Error::TokenIdCollision);
        }

        let token_id = BASE64_STANDARD.encode(token_id.as_bytes());
        Ok(Self(format!("{token_id}.{token}")))
    }

    /// Verifies and consumes the token, returning the user it was issued for
    ///
    /// Every token is single use, the row is removed whatever the outcome of the verification.
    pub async fn redeem(&self, db: &sqlx::SqlitePool) -> Result<UserId> {
        let (token_id, token) = self
            .0
            .split_once('.')
            .ok_or_eyre(Error::InvalidTokenFormat)?;

        let token_id: [u8; 16] = BASE64_STANDARD
            .decode(token_id)?
            .try_into()
            .map_err(|_| Error::InvalidTokenFormat)?;
        let token_id = Uuid::from_bytes(token_id);

        let (user_id, secret, signature, expires_at): (UserId, Uuid, Vec<u8>, DateTime<Utc>) =
            sqlx::query_as(
                "delete from refresh_tokens where id = ? returning user_id, secret, signature, expires_at",
            )
            .bind(token_id)
            .fetch_optional(db)
            .await?
            .ok_or_eyre(Error::NonExistingToken)?;

        ensure!(expires_at > Utc::now(), Error::ExpiredToken);

        let signature: [u8; 32] = signature
            .try_into()
            .map_err(|_| Error::InvalidSignatureStored)?;

        UserToken {
            user_id,
            secret,
            signature,
        }
        .verify(token)
    }

    /// Removes every refresh token of the user
    pub async fn revoke_all(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
    ) -> Result<()> {
        sqlx::query("delete from refresh_tokens where user_id = ?")
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Cleans expired tokens from database
    pub async fn cleanup(db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<()> {
        sqlx::query("delete from refresh_tokens where expires_at < ?")
            .bind(Utc::now())
            .execute(db)
            .await?;
        Ok(())
    }
}

/// Signed refresh token data
///
/// The refresh token has a structure of `{token_id}.{token}`. `token_id` identifies the entry in
/// the storage, `token` itself is never stored. The entry holds the `user_id`, a random `secret`
/// and the `signature`, a SHA3 hash of `{APP_SECRET}.{user_id}.{secret}.{token}`, so leaking any
/// single component is not enough to forge a token.
///
/// Uuids in the hashed data are Base64 encoded, which also keeps the tokens short.
#[derive(Debug, Clone)]
struct UserToken {
    /// Authorized user identifier
    user_id: UserId,
    /// Secret to build the signing key
    secret: Uuid,
    /// Expected hash
    signature: [u8; 32],
}

impl UserToken {
    /// Generate new token for the given user
    ///
    /// Returns pair of generated `UserToken` and `token` part of the refresh token that will be
    /// needed to pass for verification.
    fn generate(user_id: UserId) -> (Self, String) {
        let secret = Uuid::new_v4();
        let token = Uuid::new_v4();
        let token = BASE64_STANDARD.encode(token.as_bytes());

        let signature = Self::sign(user_id, secret, &token);

        let user_token = UserToken {
            user_id,
            secret,
            signature,
        };

        (user_token, token)
    }

    fn sign(user_id: UserId, secret: Uuid, token: &str) -> [u8; 32] {
        let secret = BASE64_STANDARD.encode(secret.as_bytes());
        let data = format!("{REFRESH_TOKEN_APP_SECRET}.{user_id}.{secret}.{token}");

        let mut hasher = Sha3_256::new();
        hasher.update(data.as_bytes());
        hasher.finalize().into()
    }

    /// Verifies the user token returning user id if verification is successfull
    fn verify(&self, token: &str) -> Result<UserId> {
        let signature = Self::sign(self.user_id, self.secret, token);
        ensure!(signature == self.signature, "Token signature doesn't match");
        Ok(self.user_id)
    }
}

/// Newtype for the access token string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SessionToken {
    /// Authenticates a token returning session
    pub async fn authenticate(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<Session> {
        Session::authenticate(db, self).await
    }

    /// Key id from the token footer
    fn key_id(&self) -> Result<String> {
        let token = UntrustedToken::<Public, V4>::try_from(&self.0)?;
        let mut footer = Footer::new();
        footer.parse_bytes(token.untrusted_footer())?;

        let key_id = footer
            .get_claim("kid")
            .ok_or_eyre(Error::MissingTokenId)?
            .as_str()
            .ok_or_eyre(Error::MissingTokenId)?;

        Ok(key_id.to_owned())
    }
}

/// Access session behind a PASETO v4 public token
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// User ID for this session
    pub user_id: UserId,
    /// Access token
    pub token: SessionToken,
    /// Session expiration time
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Creates a new session for given user storing it in DB
    pub async fn create(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
        ttl: Duration,
    ) -> Result<Self> {
        let (session, kid, pk) = Self::new(user_id, ttl)?;

        sqlx::query(
            "insert into session_tokens (id, user_id, public_key, expires_at) values (?, ?, ?, ?)",
        )
        .bind(kid)
        .bind(user_id)
        .bind(pk)
        .bind(session.expires_at)
        .execute(db)
        .await?;

        Ok(session)
    }

    /// Verifies an access token, returning the session on success
    pub async fn authenticate(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        session_token: SessionToken,
    ) -> Result<Self> {
        let token = UntrustedToken::<Public, V4>::try_from(&session_token.0)?;
        let key_id = session_token.key_id()?;

        let (key,): (String,) =
            sqlx::query_as("select public_key from session_tokens where id = ?")
                .bind(key_id)
                .fetch_optional(db)
                .await?
                .ok_or_eyre(Error::NonExistingToken)?;

        let key = AsymmetricPublicKey::<V4>::try_from(key.as_str())?;

        let rules = ClaimsValidationRules::new();
        let token = public::verify(&key, &token, &rules, None, Some(SESSION_APP_SECRET))?;

        let claims = token.payload_claims().ok_or_eyre(Error::MissingClaims)?;
        let user_id = claims
            .get_claim("sub")
            .and_then(|sub| sub.as_str())
            .ok_or_eyre(Error::MissingUserId)?
            .parse()?;

        Ok(Self {
            user_id,
            token: session_token,
            expires_at: expires_at(claims)?,
        })
    }

    /// Expires session removing it's entry in database
    pub async fn expire(self, db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<()> {
        sqlx::query("delete from session_tokens where id = ?")
            .bind(self.token.key_id()?)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Cleans expired sessions from database.
    pub async fn cleanup(db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<()> {
        sqlx::query("delete from session_tokens where expires_at < ?")
            .bind(Utc::now())
            .execute(db)
            .await?;
        Ok(())
    }

    /// Creates new session for an user.
    ///
    /// The session data are not stored in the database. The `(session, key_id, public_key)` tuple is returned instead
    /// for the purpose of storing the session.
    fn new(user_id: UserId, ttl: Duration) -> Result<(Self, String, String)> {
        let key_pair = AsymmetricKeyPair::<V4>::generate()?;
        let key_id = paserk::Id::from(&key_pair.public);

        let mut claims = Claims::new_expires_in(&ttl)?;
        claims.subject(&user_id.to_string())?;
        let expires_at = expires_at(&claims)?;

        // Key id collisions are ignored, the worst outcome is someone else's session expiring
        let mut kid = String::new();
        key_id.fmt(&mut kid)?;

        let mut pk = String::new();
        key_pair.public.fmt(&mut pk)?;

        let mut footer = Footer::new();
        footer.key_id(&key_id);

        let token = public::sign(
            &key_pair.secret,
            &claims,
            Some(&footer),
            Some(SESSION_APP_SECRET),
        )?;

        let session = Self {
            user_id,
            token: SessionToken(token),
            expires_at,
        };

        Ok((session, kid, pk))
    }
}

/// Expires the access session and revokes every refresh token of its user
pub async fn sign_out(db: &sqlx::SqlitePool, session: Session) -> Result<()> {
    let user_id = session.user_id;
    session.expire(db).await?;
    RefreshToken::revoke_all(db, user_id).await
}

/// Retrieves `expires_at` from the session claims.
fn expires_at(claims: &Claims) -> Result<DateTime<Utc>> {
    let expires_at = claims
        .get_claim("exp")
        .and_then(|exp| exp.as_str())
        .ok_or(Error::InvalidSessionClaim("exp"))?;
    expires_at.parse().map_err(Into::into)
}
