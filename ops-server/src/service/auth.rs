//! Token endpoints

use actix_web::error::{ErrorInternalServerError, ErrorUnauthorized};
use actix_web::web::{self, Data};
use actix_web::{HttpMessage, HttpRequest, HttpResponse, Result, delete, get, post};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::model::auth::{self, RefreshToken, Session};
use crate::model::users::{User, UserId};
use crate::model::{Grant, Model};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum GrantType {
    Password,
    RefreshToken,
}

#[derive(Debug, Deserialize)]
struct GrantQuery {
    grant_type: GrantType,
}

#[derive(Deserialize)]
struct PasswordGrant {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct RefreshGrant {
    refresh_token: RefreshToken,
}

/// Public user data
#[derive(Debug, Serialize)]
struct UserInfo {
    id: UserId,
    email: String,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
        }
    }
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_in: i64,
    user: UserInfo,
}

impl From<Grant> for TokenResponse {
    fn from(grant: Grant) -> Self {
        let expires_in = (grant.session.expires_at - chrono::Utc::now()).num_seconds();

        Self {
            access_token: grant.session.token.to_string(),
            refresh_token: grant.refresh_token.to_string(),
            token_type: "bearer",
            expires_in: expires_in.max(0),
            user: grant.user.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    error_description: String,
}

fn bad_request(error: &'static str, description: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorBody {
        error,
        error_description: description.into(),
    })
}

/// Password and refresh token grants
#[post("/auth/token")]
#[instrument(skip_all, fields(grant_type = ?query.grant_type))]
pub async fn token(
    query: web::Query<GrantQuery>,
    body: web::Bytes,
    model: Data<Model>,
) -> Result<HttpResponse> {
    let grant = match query.grant_type {
        GrantType::Password => {
            let Ok(PasswordGrant { email, password }) = serde_json::from_slice(&body) else {
                return Ok(bad_request("invalid_request", "Missing email or password"));
            };

            let grant = model
                .password_grant(&email, &password)
                .await
                .map_err(|err| ErrorInternalServerError(err.to_string()))?;

            match grant {
                Ok(grant) => grant,
                Err(err) => {
                    info!(%err, "Password grant rejected");
                    return Ok(bad_request("invalid_grant", err.to_string()));
                }
            }
        }
        GrantType::RefreshToken => {
            let Ok(RefreshGrant { refresh_token }) = serde_json::from_slice(&body) else {
                return Ok(bad_request("invalid_request", "Missing refresh token"));
            };

            let grant = model
                .refresh_grant(&refresh_token)
                .await
                .map_err(|err| ErrorInternalServerError(err.to_string()))?;

            match grant {
                Some(grant) => grant,
                None => return Ok(bad_request("invalid_grant", "Invalid Refresh Token")),
            }
        }
    };

    info!(user = %grant.user.id, "Tokens issued");
    Ok(HttpResponse::Ok().json(TokenResponse::from(grant)))
}

/// User owning the access token
#[get("/auth/user")]
pub async fn current_user(req: HttpRequest, model: Data<Model>) -> Result<HttpResponse> {
    let session = req
        .extensions()
        .get::<Session>()
        .cloned()
        .ok_or_else(|| ErrorUnauthorized("Missing access token"))?;

    let user = User::fetch(model.db(), session.user_id)
        .await
        .map_err(|err| ErrorInternalServerError(err.to_string()))?
        .ok_or_else(|| ErrorUnauthorized("Unknown user"))?;

    Ok(HttpResponse::Ok().json(UserInfo::from(user)))
}

/// Closes current session, revoking all the user refresh tokens
#[delete("/session")]
pub async fn expire_session(req: HttpRequest, model: Data<Model>) -> Result<HttpResponse> {
    let session = req.extensions_mut().remove::<Session>();
    if let Some(session) = session {
        let user_id = session.user_id;
        auth::sign_out(model.db(), session).await.map_err(|err| {
            warn!(%err, %user_id, "Cannot close session");
            ErrorInternalServerError("Cannot close session")
        })?;
        info!(%user_id, "Signed out");
    }

    Ok(HttpResponse::NoContent().finish())
}
