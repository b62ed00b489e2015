//! Optional bearer-token middleware.
//!
//! When `--auth-token` is configured every endpoint except `/health`
//! requires `Authorization: Bearer <token>`, with a `?token=` query
//! fallback for WebSocket upgrades where browsers cannot set headers.
//! This gate is separate from identity resolution: it answers "may you
//! talk to the relay at all", not "what may you run".

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::error::ApiError;

pub async fn auth_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();

    if path == "/health" {
        return Ok(next.run(req).await);
    }

    if let Some(value) = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if token == expected_token {
                return Ok(next.run(req).await);
            }
        }
    }

    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if token == expected_token {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    warn!(
        component = "auth",
        event = "auth.rejected",
        path = %path,
        "Request rejected, missing or invalid token"
    );
    Err(ApiError::Unauthorized("missing or invalid token".into()))
}
