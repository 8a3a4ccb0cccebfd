//! Admission middleware.
//!
//! Classifies every request (trusted / key-authenticated / rejected)
//! before routing. The admission level is stashed in request extensions
//! for handlers that distinguish trusted clients, such as one-shot token
//! issuance.

use crate::auth::Authorization;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::{Layer, Service};
use tracing::debug;

/// Layer wrapping routes with the admission check.
#[derive(Clone)]
pub struct AuthLayer {
    auth: Arc<Authorization>,
}

impl AuthLayer {
    pub fn new(auth: Arc<Authorization>) -> Self {
        Self { auth }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            auth: Arc::clone(&self.auth),
        }
    }
}

/// Admission service.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    auth: Arc<Authorization>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let remote = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        let api_key = req
            .headers()
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let token = query_param(req.uri().query(), "token");

        let level = remote.and_then(|ip| self.auth.check(ip, api_key.as_deref(), token.as_deref()));

        match level {
            Some(level) => {
                req.extensions_mut().insert(level);
                let mut inner = self.inner.clone();
                Box::pin(async move { inner.call(req).await })
            }
            None => {
                debug!(remote = ?remote, path = %req.uri().path(), "request rejected");
                Box::pin(async move { Ok(unauthorized_response()) })
            }
        }
    }
}

/// Extract one query parameter, percent-decoded.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query?).ok()?;
    pairs
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

fn unauthorized_response() -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .body(Body::from("unauthorized"))
        .unwrap_or_default()
}
