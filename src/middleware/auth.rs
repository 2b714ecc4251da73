//! Auth extractor: verified identity from the `Authorization: Bearer` header.

use axum::extract::FromRequestParts;
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use tracing::debug;

use crate::auth::Identity;
use crate::error::AppError;
use crate::handlers::http::AppState;

/// Extractor: authenticated caller of an HTTP endpoint.
#[derive(Clone, Debug)]
pub struct AuthUser(pub Identity);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|e| {
                    debug!(error = %e, "rejected request without bearer token");
                    AppError::Unauthenticated("Missing or invalid Authorization header".to_string())
                })?;
        let identity = state.jwt_secret().validate(bearer.token())?;
        Ok(AuthUser(identity))
    }
}
