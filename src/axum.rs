//! Axum integration utilities.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::{error, warn};

use crate::cache::DistributedCache;
use crate::engine::{Decision, Engine};
use crate::permission::Permission;
use crate::store::{RoleStore, TenantStore};
use crate::types::UserId;

use ::axum::body::Body;
use ::axum::extract::FromRequestParts;
use ::axum::http::request::Parts;
use ::axum::http::{Request, StatusCode};
use ::axum::response::{IntoResponse, Response};
use ::tower::{Layer, Service};

/// Authenticated user attached to a request by the application's login layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// User identifier.
    pub user: UserId,
}

impl AuthContext {
    /// Creates a context for `user`.
    pub fn new(user: UserId) -> Self {
        Self { user }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for AuthContext {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or((StatusCode::UNAUTHORIZED, "missing auth context"))
    }
}

/// Middleware layer that authorizes a request using [`Engine`].
///
/// Requests of users whose tenant is down for maintenance get
/// `503 Service Unavailable`.
#[derive(Debug)]
pub struct AuthorizeLayer<S, C> {
    engine: Arc<Engine<S, C>>,
    permission: Permission,
}

impl<S, C> Clone for AuthorizeLayer<S, C> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            permission: self.permission,
        }
    }
}

impl<S, C> AuthorizeLayer<S, C> {
    /// Creates a new authorization layer.
    pub fn new(engine: Arc<Engine<S, C>>, permission: Permission) -> Self {
        Self { engine, permission }
    }
}

impl<S, C, Inner> Layer<Inner> for AuthorizeLayer<S, C> {
    type Service = AuthorizeService<Inner, S, C>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AuthorizeService {
            inner,
            engine: self.engine.clone(),
            permission: self.permission,
        }
    }
}

/// Middleware service that enforces permission checks.
#[derive(Debug)]
pub struct AuthorizeService<Inner, S, C> {
    inner: Inner,
    engine: Arc<Engine<S, C>>,
    permission: Permission,
}

impl<Inner: Clone, S, C> Clone for AuthorizeService<Inner, S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
            permission: self.permission,
        }
    }
}

impl<Inner, S, C> Service<Request<Body>> for AuthorizeService<Inner, S, C>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: RoleStore + TenantStore + Send + Sync + 'static,
    C: DistributedCache + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let engine = self.engine.clone();
        let permission = self.permission;

        Box::pin(async move {
            let context = req.extensions().get::<AuthContext>().cloned();
            let Some(context) = context else {
                return Ok((StatusCode::UNAUTHORIZED, "missing auth context").into_response());
            };

            match engine.is_tenant_down(&context.user).await {
                Ok(false) => {}
                Ok(true) => {
                    warn!(user = %context.user, "request rejected, tenant is down for maintenance");
                    return Ok((
                        StatusCode::SERVICE_UNAVAILABLE,
                        "tenant is down for maintenance",
                    )
                        .into_response());
                }
                Err(err) => {
                    error!(user = %context.user, error = %err, "tenant status check failed");
                    return Ok((StatusCode::INTERNAL_SERVER_ERROR, "auth error").into_response());
                }
            }

            match engine.authorize(&context.user, permission).await {
                Ok(Decision::Allow) => {
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Ok(Decision::Deny) => Ok((StatusCode::FORBIDDEN, "forbidden").into_response()),
                Err(err) => {
                    error!(user = %context.user, error = %err, "authorization failed");
                    Ok((StatusCode::INTERNAL_SERVER_ERROR, "auth error").into_response())
                }
            }
        })
    }
}

#[cfg(all(test, feature = "memory-store", feature = "memory-cache"))]
mod tests {
    use super::*;
    use crate::cache::{tenant_down_key, user_permissions_key};
    use crate::config::TenantType;
    use crate::engine::EngineBuilder;
    use crate::memory_cache::MemoryCache;
    use crate::memory_store::MemoryStore;
    use crate::permission::PackedPermissions;
    use crate::role::{AuthUser, Role};
    use crate::store::{IsolationLevel, StoreTransaction, Transactional};
    use crate::tenant::NewTenant;
    use crate::types::RoleName;
    use futures::executor::block_on;
    use std::convert::Infallible;
    use std::future::{Ready, ready};

    #[derive(Clone)]
    struct Ok200;

    impl Service<Request<Body>> for Ok200 {
        type Response = Response;
        type Error = Infallible;
        type Future = Ready<Result<Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            ready(Ok(StatusCode::OK.into_response()))
        }
    }

    fn perm(code: u16) -> Permission {
        Permission::new(code).unwrap()
    }

    fn setup() -> (MemoryStore, MemoryCache) {
        let store = MemoryStore::new();
        let reader = RoleName::new("Reader").unwrap();
        store.add_role(Role::new(
            reader.clone(),
            PackedPermissions::pack([perm(1)]),
        ));
        let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        let mut tenant = block_on(tx.insert_tenant(NewTenant {
            full_name: "Acme".to_string(),
            parent_id: None,
            is_hierarchical: false,
            database_info_name: None,
            has_own_db: false,
            tenant_roles: Vec::new(),
        }))
        .unwrap();
        tenant.data_key = format!("{}.", tenant.id);
        block_on(tx.update_tenant(&tenant)).unwrap();
        block_on(tx.commit()).unwrap();
        let mut user = AuthUser::new(UserId::new("u1").unwrap(), "u1@example.com").in_tenant(tenant.id);
        user.roles.push(reader);
        store.add_user(user);
        (store, MemoryCache::new())
    }

    fn call(
        store: MemoryStore,
        cache: MemoryCache,
        permission: Permission,
        user: Option<&str>,
    ) -> StatusCode {
        let engine = EngineBuilder::new(store)
            .cache(cache)
            .tenant_type(TenantType::SingleLevel)
            .build();
        let mut service = AuthorizeLayer::new(Arc::new(engine), permission).layer(Ok200);
        let mut req = Request::new(Body::empty());
        if let Some(user) = user {
            req.extensions_mut()
                .insert(AuthContext::new(UserId::new(user).unwrap()));
        }
        block_on(service.call(req)).unwrap().status()
    }

    #[test]
    fn missing_context_is_unauthorized() {
        let (store, cache) = setup();
        assert_eq!(call(store, cache, perm(1), None), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn granted_permission_passes_through() {
        let (store, cache) = setup();
        assert_eq!(call(store, cache.clone(), perm(1), Some("u1")), StatusCode::OK);
        assert!(block_on(cache.get(&user_permissions_key("u1"))).unwrap().is_some());
    }

    #[test]
    fn missing_permission_is_forbidden() {
        let (store, cache) = setup();
        assert_eq!(call(store, cache, perm(2), Some("u1")), StatusCode::FORBIDDEN);
    }

    #[test]
    fn down_tenant_is_unavailable() {
        let (store, cache) = setup();
        let data_key = block_on(store.tenants()).unwrap()[0].data_key.clone();
        block_on(cache.set(&tenant_down_key(&data_key), data_key.clone())).unwrap();

        assert_eq!(
            call(store, cache, perm(1), Some("u1")),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
