//! HTTP surface of the backend

use actix_web::web::{Data, ServiceConfig};
use actix_web::{HttpMessage, middleware};
use actix_web::{HttpRequest, HttpResponse, Result, get, post, web};
use async_graphql::EmptySubscription;
use async_graphql::http::GraphiQLSource;
use async_graphql_actix_web::{GraphQLRequest, GraphQLResponse};
use tracing::debug;


pub mod assets;
mod auth;
mod session;

use crate::model::Model;
use crate::model::auth::Session;
use crate::mutation::Mutation;
use crate::query::Query;
use crate::service::assets::Assets;

/// Root GraphQL schema
pub type Schema = async_graphql::Schema<Query, Mutation, EmptySubscription>;

/// ActixWeb GraphQL endpoint
#[post("/api")]
async fn api(
    schema: web::Data<Schema>,
    req: HttpRequest,
    request: GraphQLRequest,
) -> GraphQLResponse {
    let mut request = request.into_inner();
    if let Some(session) = req.extensions_mut().remove::<Session>() {
        debug!(user = %session.user_id, operation = ?request.operation_name, "Authenticated API call");
        request = request.data(session);
    }
    schema.execute(request).await.into()
}

/// ActixWeb GraphQLi endpoint
#[get("/pg")]
async fn graphiql() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(GraphiQLSource::build().endpoint("/api").finish()))
}

/// Returns configuration function for the ActixWeb services
///
/// Without `assets` unknown paths are answered with 404.
pub async fn configure(
    graphiql_enabled: bool,
    model: Model,
    assets: Option<Assets>,
) -> color_eyre::Result<impl Fn(&mut web::ServiceConfig) + Clone> {
    let cfg = move |cfg: &mut ServiceConfig| {
        cfg.app_data(Data::new(model.schema()))
            .app_data(Data::new(model.clone()))
            .service(auth::token);

        if let Some(assets) = &assets {
            cfg.app_data(Data::new(assets.clone()));
        }

        if graphiql_enabled {
            cfg.service(graphiql);
        }

        // Matches every path, has to go last
        let session_aware = {
            web::scope("")
                .wrap(middleware::from_fn(session::middleware))
                .service(api)
                .service(auth::current_user)
                .service(auth::expire_session)
                .default_service(web::to(assets::serve))
        };

        cfg.service(session_aware);
    };

    Ok(cfg)
}
