//! HTTP client of the operations backend

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::identity::{
    AuthEvent, AuthEventKind, AuthEvents, AuthUser, Credentials, IdentityError, IdentityService,
    RoleRow, UserId,
};

const ROLE_QUERY: &str = r#"
    query Role($userId: UserId!) {
        roles { role(userId: $userId) { userId email role } }
    }
"#;

const BOOTSTRAP_MUTATION: &str = r#"
    mutation Bootstrap($userId: UserId!) {
        roles { bootstrap(userId: $userId) { userId } }
    }
"#;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    user: AuthUser,
}

impl From<TokenResponse> for Credentials {
    fn from(response: TokenResponse) -> Self {
        Credentials {
            user: response.user,
            access_token: response.access_token,
            refresh_token: response.refresh_token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Deserialize)]
struct GraphQLResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQLError>,
}

#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct RoleData {
    roles: RoleField,
}

#[derive(Debug, Deserialize)]
struct RoleField {
    role: Option<RoleRow>,
}

fn unavailable(err: reqwest::Error) -> IdentityError {
    IdentityError::Unavailable(err.to_string())
}

fn malformed(err: reqwest::Error) -> IdentityError {
    IdentityError::Malformed(err.to_string())
}

/// Maps GraphQL error messages to the identity errors
fn graphql_error(message: String) -> IdentityError {
    match message.as_str() {
        "Unauthorized" | "Forbidden" => IdentityError::Unauthorized,
        _ => IdentityError::Unavailable(message),
    }
}

/// Maps failed token endpoint responses to the identity errors
fn grant_error(status: StatusCode, body: &str) -> IdentityError {
    if status.is_server_error() {
        return IdentityError::Unavailable(format!("HTTP {status}"));
    }

    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(ErrorResponse {
            error_description, ..
        }) if !error_description.is_empty() => IdentityError::Auth(error_description),
        Ok(ErrorResponse { error, .. }) if !error.is_empty() => IdentityError::Auth(error),
        _ if status == StatusCode::UNAUTHORIZED => IdentityError::Unauthorized,
        _ => IdentityError::Malformed(format!("HTTP {status}: {body}")),
    }
}

/// Identity service backed by `rtg-ops-server`
///
/// Keeps the installed session in memory and notifies subscribers whenever it changes. Nothing
/// is persisted here, that's the token store job.
pub struct RemoteIdentity {
    http: reqwest::Client,
    base_url: String,
    session: RwLock<Option<Credentials>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AuthEvent>>>,
}

impl RemoteIdentity {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            session: RwLock::new(None),
            subscribers: Mutex::new(vec![]),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// User of the installed session
    pub fn current_user(&self) -> Option<AuthUser> {
        self.session.read().as_ref().map(|session| session.user.clone())
    }

    fn access_token(&self) -> Option<String> {
        self.session
            .read()
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    fn emit(&self, kind: AuthEventKind, user: Option<AuthUser>) {
        let event = AuthEvent::new(kind, user);
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    async fn grant(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<Credentials, IdentityError> {
        let response = self
            .http
            .post(self.url("/auth/token"))
            .query(&[("grant_type", grant_type)])
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(grant_error(status, &body));
        }

        let tokens: TokenResponse = response.json().await.map_err(malformed)?;
        Ok(tokens.into())
    }

    async fn fetch_user(&self, access_token: &str) -> Result<AuthUser, IdentityError> {
        let response = self
            .http
            .get(self.url("/auth/user"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            status if status.is_success() => response.json().await.map_err(malformed),
            StatusCode::UNAUTHORIZED => Err(IdentityError::Unauthorized),
            status if status.is_server_error() => {
                Err(IdentityError::Unavailable(format!("HTTP {status}")))
            }
            status => Err(IdentityError::Malformed(format!("HTTP {status}"))),
        }
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, IdentityError> {
        let token = self.access_token().ok_or(IdentityError::Unauthorized)?;
        let response = self
            .http
            .post(self.url("/api"))
            .bearer_auth(token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(IdentityError::Unauthorized);
        }
        if status.is_server_error() {
            return Err(IdentityError::Unavailable(format!("HTTP {status}")));
        }

        let response: GraphQLResponse<T> = response.json().await.map_err(malformed)?;
        if let Some(error) = response.errors.into_iter().next() {
            return Err(graphql_error(error.message));
        }

        response
            .data
            .ok_or_else(|| IdentityError::Malformed("Response without data".to_owned()))
    }
}

#[async_trait]
impl IdentityService for RemoteIdentity {
    #[instrument(skip(self, password))]
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Credentials, IdentityError> {
        self.grant("password", json!({ "email": email, "password": password }))
            .await
    }

    #[instrument(skip_all)]
    async fn set_session(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<Credentials, IdentityError> {
        let (credentials, kind) = match self.fetch_user(access_token).await {
            Ok(user) => (
                Credentials {
                    user,
                    access_token: access_token.to_owned(),
                    refresh_token: refresh_token.to_owned(),
                },
                AuthEventKind::SignedIn,
            ),
            Err(IdentityError::Unauthorized) => {
                debug!("Access token rejected, refreshing");
                let credentials = self
                    .grant("refresh_token", json!({ "refresh_token": refresh_token }))
                    .await?;
                (credentials, AuthEventKind::TokenRefreshed)
            }
            Err(err) => return Err(err),
        };

        *self.session.write() = Some(credentials.clone());
        self.emit(kind, Some(credentials.user.clone()));
        Ok(credentials)
    }

    #[instrument(skip(self))]
    async fn sign_out(&self) -> Result<(), IdentityError> {
        let session = self.session.write().take();
        let Some(session) = session else {
            return Ok(());
        };
        self.emit(AuthEventKind::SignedOut, None);

        let response = self
            .http
            .delete(self.url("/session"))
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // Already gone on the server
            StatusCode::UNAUTHORIZED => Ok(()),
            status => Err(IdentityError::Unavailable(format!("HTTP {status}"))),
        }
    }

    #[instrument(skip(self))]
    async fn fetch_role(&self, user_id: UserId) -> Result<Option<RoleRow>, IdentityError> {
        let data: RoleData = self
            .graphql(ROLE_QUERY, json!({ "userId": user_id }))
            .await?;
        Ok(data.roles.role)
    }

    #[instrument(skip(self, user), fields(user = %user.id))]
    async fn bootstrap_role(&self, user: &AuthUser) -> Result<(), IdentityError> {
        let _: serde_json::Value = self
            .graphql(
                BOOTSTRAP_MUTATION,
                json!({ "userId": user.id }),
            )
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> AuthEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(AuthEvent::new(
            AuthEventKind::InitialSession,
            self.current_user(),
        ));
        self.subscribers.lock().push(tx);
        rx
    }
}

impl std::fmt::Debug for RemoteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteIdentity")
            .field("base_url", &self.base_url)
            .field("user", &self.current_user())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_errors() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        assert_eq!(
            grant_error(StatusCode::BAD_REQUEST, body),
            IdentityError::Auth("Invalid login credentials".to_owned())
        );

        assert_eq!(
            grant_error(StatusCode::BAD_REQUEST, r#"{"error":"unsupported_grant_type"}"#),
            IdentityError::Auth("unsupported_grant_type".to_owned())
        );

        assert_eq!(
            grant_error(StatusCode::UNAUTHORIZED, ""),
            IdentityError::Unauthorized
        );

        assert!(grant_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            grant_error(StatusCode::NOT_FOUND, "<html>"),
            IdentityError::Malformed(_)
        ));
    }

    #[test]
    fn graphql_errors() {
        assert_eq!(
            graphql_error("Unauthorized".to_owned()),
            IdentityError::Unauthorized
        );
        assert_eq!(
            graphql_error("Forbidden".to_owned()),
            IdentityError::Unauthorized
        );
        assert!(graphql_error("database is locked".to_owned()).is_transient());
    }

    #[test]
    fn role_data_decodes() {
        let data: GraphQLResponse<RoleData> = serde_json::from_value(json!({
            "data": { "roles": { "role": {
                "userId": "6f1c2d9e-8a37-4d5b-9c1e-2b7f0a4e5d63",
                "email": "operator@example.com",
                "role": "operator",
            } } }
        }))
        .unwrap();

        let row = data.data.unwrap().roles.role.unwrap();
        assert_eq!(row.role, Some(crate::role::Role::Operator));

        let data: GraphQLResponse<RoleData> =
            serde_json::from_value(json!({ "data": { "roles": { "role": null } } })).unwrap();
        assert_eq!(data.data.unwrap().roles.role, None);
    }

    #[tokio::test]
    async fn subscribe_starts_with_initial_session() {
        let identity = RemoteIdentity::new("http://127.0.0.1:9/");
        let mut events = identity.subscribe();

        assert_eq!(
            events.recv().await,
            Some(AuthEvent::new(AuthEventKind::InitialSession, None))
        );
        assert_eq!(identity.url("/api"), "http://127.0.0.1:9/api");
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let identity = RemoteIdentity::new("http://127.0.0.1:9");
        let err = identity
            .sign_in_with_password("operator@example.com", "hunter22")
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err:?}");

        // No session installed, nothing to authorize the call with
        assert_eq!(
            identity.fetch_role(UserId::random()).await,
            Err(IdentityError::Unauthorized)
        );
    }
}
