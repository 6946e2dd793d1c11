//! Outward API bearer-token check (§6, §9 Non-goals: "no full auth flow" --
//! a single static token, not a login/session/JWT exchange).
//!
//! Grounded in the teacher's `auth_layer`/`AuthBearer` split: a middleware
//! that rejects unauthenticated requests before the handler runs, plus a
//! marker extractor handlers can require without re-parsing the header
//! themselves.

use axum::{
    body::Body,
    extract::FromRequestParts,
    http::{request::Parts, Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Rejects any request whose `Authorization: Bearer <token>` header does
/// not match `expected_token`. Mounted ahead of every `/api/v1` route
/// except `/healthz`.
pub async fn auth_layer(
    expected_token: axum::extract::State<std::sync::Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected_token.0.as_ref() => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Marker extractor: presence in a handler's signature documents that the
/// route is gated by `auth_layer`. Does not re-validate the token --
/// `auth_layer` has already rejected the request by the time a handler
/// runs.
#[derive(Debug, Clone, Copy)]
pub struct Authenticated;

#[axum::async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let has_bearer = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("Bearer "))
            .unwrap_or(false);
        if has_bearer {
            Ok(Authenticated)
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
