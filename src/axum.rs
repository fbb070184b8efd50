//! Axum integration utilities.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::engine::PolicyEngine;
use crate::store::PolicyStore;
use crate::types::{ActionId, ObjectId, SubjectId, TenantId};

use ::axum::body::Body;
use ::axum::response::{IntoResponse, Response};
use ::http::{Request, StatusCode};
use ::tower::{Layer, Service};

/// Body returned when the policy store cannot be consulted.
pub const UNAVAILABLE_MESSAGE: &str = "service temporarily unavailable";

/// Identity of the caller, placed in request extensions by an upstream
/// authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Tenant identifier.
    pub tenant: TenantId,
    /// Subject identifier.
    pub subject: SubjectId,
}

impl AuthContext {
    /// Creates a new context.
    pub fn new(tenant: TenantId, subject: SubjectId) -> Self {
        Self { tenant, subject }
    }
}

/// Middleware layer that requires `action` on `object` for every request.
#[derive(Debug)]
pub struct AuthorizeLayer<S> {
    engine: Arc<PolicyEngine<S>>,
    object: ObjectId,
    action: ActionId,
}

impl<S> Clone for AuthorizeLayer<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            object: self.object.clone(),
            action: self.action.clone(),
        }
    }
}

impl<S> AuthorizeLayer<S> {
    /// Creates a new authorization layer.
    pub fn new(engine: Arc<PolicyEngine<S>>, object: ObjectId, action: ActionId) -> Self {
        Self {
            engine,
            object,
            action,
        }
    }
}

impl<S, Inner> Layer<Inner> for AuthorizeLayer<S>
where
    S: PolicyStore,
{
    type Service = AuthorizeService<Inner, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AuthorizeService {
            inner,
            engine: Arc::clone(&self.engine),
            object: self.object.clone(),
            action: self.action.clone(),
        }
    }
}

/// Middleware service that enforces policy checks.
///
/// Allowed requests reach the inner service; denied ones get `403`; a missing
/// [`AuthContext`] gets `401`; any engine error gets `503`. Errors never let
/// the request through.
#[derive(Debug)]
pub struct AuthorizeService<Inner, S> {
    inner: Inner,
    engine: Arc<PolicyEngine<S>>,
    object: ObjectId,
    action: ActionId,
}

impl<Inner: Clone, S> Clone for AuthorizeService<Inner, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: Arc::clone(&self.engine),
            object: self.object.clone(),
            action: self.action.clone(),
        }
    }
}

impl<Inner, S> Service<Request<Body>> for AuthorizeService<Inner, S>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: PolicyStore + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let engine = Arc::clone(&self.engine);
        let object = self.object.clone();
        let action = self.action.clone();

        Box::pin(async move {
            let context = req.extensions().get::<AuthContext>().cloned();
            let Some(context) = context else {
                return Ok((StatusCode::UNAUTHORIZED, "missing auth context").into_response());
            };

            match engine
                .check(&context.tenant, &context.subject, &object, &action)
                .await
            {
                Ok(true) => {
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Ok(false) => Ok((StatusCode::FORBIDDEN, "forbidden").into_response()),
                Err(_) => Ok((StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_MESSAGE).into_response()),
            }
        })
    }
}
