//! Session management

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::error::{ErrorInternalServerError, ErrorUnauthorized};
use actix_web::http::header;
use actix_web::middleware::Next;
use actix_web::web::Data;
use actix_web::{Error, HttpMessage};
use tracing::debug;

use crate::model::Model;
use crate::model::auth::{Bearer, Session};

/// Attaches the session of the `Authorization: Bearer` token to the request
///
/// Requests without the header pass through anonymously, requests with an invalid token are
/// rejected.
pub async fn middleware<B>(req: ServiceRequest, next: Next<B>) -> Result<ServiceResponse<B>, Error>
where
    B: MessageBody + 'static,
{
    if let Some(auth_header) = req.headers().get(header::AUTHORIZATION) {
        let auth_header = auth_header
            .to_str()
            .map_err(|err| ErrorUnauthorized(err.to_string()))?;

        let Bearer(token) = auth_header
            .parse()
            .map_err(|err: crate::model::auth::Error| ErrorUnauthorized(err.to_string()))?;

        let model: Data<Model> = req
            .app_data()
            .cloned()
            .ok_or_else(|| ErrorInternalServerError("Missing model"))?;

        let session = token.authenticate(model.db()).await.map_err(|err| {
            debug!(%err, "Access token rejected");
            ErrorUnauthorized("Invalid access token")
        })?;

        req.extensions_mut().insert::<Session>(session);
    }

    next.call(req).await
}
