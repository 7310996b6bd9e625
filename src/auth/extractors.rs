use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use axum_extra::extract::cookie::CookieJar;

use crate::auth::handlers::COOKIE_NAME;
use crate::auth::repo_types::User;
use crate::auth::services;
use crate::error::AppError;
use crate::state::AppState;

/// Extracts the authenticated user from the session cookie.
///
/// Rejects with 401 when the cookie is missing, the token fails validation,
/// or the subject no longer resolves to an active user.
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(COOKIE_NAME)
            .map(|c| c.value().to_owned())
            .ok_or(AppError::Unauthenticated)?;

        let user = services::resolve_session(&*state.users, &state.tokens, &token).await?;
        Ok(CurrentUser(user))
    }
}

/// Client identity for rate limiting: first hop of `X-Forwarded-For` when
/// present, else the transport peer address, else a shared "unknown" bucket.
/// Never fails.
pub struct ClientIp(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(forwarded) = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded
                .split(',')
                .next()
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                return Ok(ClientIp(first.to_owned()));
            }
        }

        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        Ok(ClientIp(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn client_ip(req: Request<()>) -> String {
        let (mut parts, _) = req.into_parts();
        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        ip
    }

    #[tokio::test]
    async fn prefers_first_forwarded_hop() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_ip(req).await, "203.0.113.9");
    }

    #[tokio::test]
    async fn falls_back_to_peer_address() {
        let mut req = Request::builder().body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("198.51.100.7:4242".parse::<SocketAddr>().unwrap()));
        assert_eq!(client_ip(req).await, "198.51.100.7");
    }

    #[tokio::test]
    async fn degrades_to_unknown() {
        let req = Request::builder().body(()).unwrap();
        assert_eq!(client_ip(req).await, "unknown");
    }

    #[tokio::test]
    async fn empty_forwarded_header_falls_through() {
        let req = Request::builder()
            .header("x-forwarded-for", "")
            .body(())
            .unwrap();
        assert_eq!(client_ip(req).await, "unknown");
    }
}
