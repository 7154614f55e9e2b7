//! Service registry and dispatch.
//!
//! Registration is explicit and happens once at configuration time: a
//! [`Service`] is a named group of typed method handlers whose argument and
//! reply shapes round-trip through the codec's serialization format. The
//! registry is immutable while serving.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use duplex_rpc::errors::RpcError;
use duplex_rpc::params;

use crate::connection::Connection;

/// Registration-time failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A service with this name is already registered.
    #[error("service '{0}' is already registered")]
    DuplicateService(String),
    /// The service exposes no methods.
    #[error("service '{0}' has no methods; add methods with Service::method before registering")]
    NoMethods(String),
}

/// A dispatchable method handler.
pub trait MethodHandler: Send + Sync {
    /// Invoke the handler with the call's connection and raw params.
    fn call(
        &self,
        conn: Arc<Connection>,
        params: Value,
    ) -> BoxFuture<'static, Result<Value, RpcError>>;
}

/// Handler invoked when `Service.Method` lookup fails.
pub trait FallbackHandler: Send + Sync {
    /// Invoke with the unmatched method name and raw params.
    fn call(
        &self,
        conn: Arc<Connection>,
        method: String,
        params: Value,
    ) -> BoxFuture<'static, Result<Value, RpcError>>;
}

impl<F, Fut> FallbackHandler for F
where
    F: Fn(Arc<Connection>, String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    fn call(
        &self,
        conn: Arc<Connection>,
        method: String,
        params: Value,
    ) -> BoxFuture<'static, Result<Value, RpcError>> {
        Box::pin(self(conn, method, params))
    }
}

/// Continuation passed to middleware: runs the wrapped handler.
pub type Next = Box<dyn FnOnce(Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send>;

/// Decorator wrapped around every dispatched call, for cross-cutting
/// behavior such as logging or auth.
pub trait Middleware: Send + Sync {
    /// Run the call, optionally altering params or the outcome.
    fn around(
        &self,
        conn: Arc<Connection>,
        method: String,
        params: Value,
        next: Next,
    ) -> BoxFuture<'static, Result<Value, RpcError>>;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Arc<Connection>, String, Value, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    fn around(
        &self,
        conn: Arc<Connection>,
        method: String,
        params: Value,
        next: Next,
    ) -> BoxFuture<'static, Result<Value, RpcError>> {
        Box::pin(self(conn, method, params, next))
    }
}

/// Adapter from a typed async function to a [`MethodHandler`]: decodes the
/// argument shape (with the bare-value shim), invokes, encodes the reply.
struct TypedHandler<F, Args, Reply> {
    f: Arc<F>,
    _marker: PhantomData<fn(Args) -> Reply>,
}

impl<F, Fut, Args, Reply> MethodHandler for TypedHandler<F, Args, Reply>
where
    F: Fn(Arc<Connection>, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, RpcError>> + Send + 'static,
    Args: DeserializeOwned + Send + 'static,
    Reply: Serialize + Send + 'static,
{
    fn call(
        &self,
        conn: Arc<Connection>,
        raw: Value,
    ) -> BoxFuture<'static, Result<Value, RpcError>> {
        let f = Arc::clone(&self.f);
        Box::pin(async move {
            let args = params::decode::<Args>(raw)?;
            let reply = f(conn, args).await?;
            serde_json::to_value(reply).map_err(|e| RpcError::Internal {
                message: format!("cannot encode reply: {e}"),
            })
        })
    }
}

/// A named group of method handlers, assembled before registration.
#[derive(Default)]
pub struct Service {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Service {
    /// Empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed method. Method names within a service are unique; adding
    /// a name twice keeps the later handler.
    #[must_use]
    pub fn method<F, Fut, Args, Reply>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Arc<Connection>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, RpcError>> + Send + 'static,
        Args: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
    {
        let handler = TypedHandler {
            f: Arc::new(f),
            _marker: PhantomData,
        };
        let _ = self.methods.insert(name.to_owned(), Arc::new(handler));
        self
    }

    /// Add a handler working directly on raw JSON values.
    #[must_use]
    pub fn raw_method(mut self, name: &str, handler: impl MethodHandler + 'static) -> Self {
        let _ = self.methods.insert(name.to_owned(), Arc::new(handler));
        self
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the service has no methods.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Maps `Service.Method` names to handlers.
///
/// Populated once at startup; not safe to mutate concurrently with serving.
#[derive(Default)]
pub struct Registry {
    services: HashMap<String, Service>,
    fallback: Option<Arc<dyn FallbackHandler>>,
    middleware: Option<Arc<dyn Middleware>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under `name`.
    ///
    /// Rejects duplicate service names and services with zero methods;
    /// neither replaces an existing registration.
    pub fn register(&mut self, name: &str, service: Service) -> Result<(), RegistryError> {
        if service.is_empty() {
            return Err(RegistryError::NoMethods(name.to_owned()));
        }
        if self.services.contains_key(name) {
            return Err(RegistryError::DuplicateService(name.to_owned()));
        }
        let _ = self.services.insert(name.to_owned(), service);
        Ok(())
    }

    /// Install the handler for calls whose `Service.Method` resolves to no
    /// registered handler.
    pub fn register_fallback(&mut self, fallback: impl FallbackHandler + 'static) {
        self.fallback = Some(Arc::new(fallback));
    }

    /// Install the middleware wrapped around every dispatched call.
    pub fn register_middleware(&mut self, middleware: impl Middleware + 'static) {
        self.middleware = Some(Arc::new(middleware));
    }

    /// Sorted `Service.Method` names.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .flat_map(|(service, entry)| {
                entry
                    .methods
                    .keys()
                    .map(move |method| format!("{service}.{method}"))
            })
            .collect();
        names.sort();
        names
    }

    /// Whether `Service.Method` resolves to a handler.
    pub fn has_method(&self, service_method: &str) -> bool {
        service_method
            .rsplit_once('.')
            .and_then(|(service, method)| {
                self.services.get(service).map(|s| s.methods.contains_key(method))
            })
            .unwrap_or(false)
    }

    /// Dispatch one call.
    ///
    /// Handler errors never escape: every outcome is a reply value or an
    /// [`RpcError`] destined for the response's error field.
    pub async fn dispatch(
        &self,
        conn: &Arc<Connection>,
        service_method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        counter!("rpc_calls_total", "method" => service_method.to_owned()).increment(1);
        let start = Instant::now();

        let outcome = self.dispatch_inner(conn, service_method, params).await;

        if let Err(e) = &outcome {
            counter!(
                "rpc_call_errors_total",
                "method" => service_method.to_owned(),
                "code" => e.code().to_owned()
            )
            .increment(1);
        }
        let duration = start.elapsed();
        histogram!("rpc_call_duration_seconds", "method" => service_method.to_owned())
            .record(duration.as_secs_f64());
        if duration.as_secs() >= 5 {
            warn!(
                method = service_method,
                duration_secs = duration.as_secs_f64(),
                "slow call"
            );
        }

        outcome
    }

    async fn dispatch_inner(
        &self,
        conn: &Arc<Connection>,
        service_method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        let Some((service, method)) = service_method.rsplit_once('.') else {
            return Err(RpcError::InvalidRequest {
                message: format!("service/method request ill-formed: '{service_method}'"),
            });
        };

        let handler = self
            .services
            .get(service)
            .and_then(|entry| entry.methods.get(method));

        match handler {
            Some(handler) => {
                let handler = Arc::clone(handler);
                let next_conn = Arc::clone(conn);
                let next: Next = Box::new(move |p| handler.call(next_conn, p));
                self.run(conn, service_method, params, next).await
            }
            None => match &self.fallback {
                Some(fallback) => {
                    let fallback = Arc::clone(fallback);
                    let name = service_method.to_owned();
                    let next_conn = Arc::clone(conn);
                    let next: Next = Box::new(move |p| fallback.call(next_conn, name, p));
                    self.run(conn, service_method, params, next).await
                }
                None if self.services.contains_key(service) => Err(RpcError::MethodNotFound {
                    message: format!("can't find method '{service_method}'"),
                }),
                None => Err(RpcError::MethodNotFound {
                    message: format!("can't find service '{service_method}'"),
                }),
            },
        }
    }

    async fn run(
        &self,
        conn: &Arc<Connection>,
        method: &str,
        params: Value,
        next: Next,
    ) -> Result<Value, RpcError> {
        match &self.middleware {
            Some(middleware) => {
                middleware
                    .around(Arc::clone(conn), method.to_owned(), params, next)
                    .await
            }
            None => next(params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::transport::{mem, Transport};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn make_connection() -> Arc<Connection> {
        // Dispatch itself never touches the transport; the write side only
        // matters to the serve loop, which has its own tests.
        let (server, _client) = mem::pair(16);
        let (_rx, tx) = server.into_split();
        Connection::new(Codec::new(Box::new(tx)))
    }

    fn math_service() -> Service {
        Service::new().method("Add", |_conn: Arc<Connection>, args: AddArgs| async move {
            Ok::<_, RpcError>(args.a + args.b)
        })
    }

    #[tokio::test]
    async fn register_and_dispatch() {
        let mut registry = Registry::new();
        registry.register("Math", math_service()).unwrap();

        let conn = make_connection();
        let result = registry
            .dispatch(&conn, "Math.Add", json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn duplicate_service_rejected_without_replacing() {
        let mut registry = Registry::new();
        registry.register("Math", math_service()).unwrap();

        let replacement = Service::new().method(
            "Add",
            |_conn: Arc<Connection>, _args: Value| async move { Ok::<_, RpcError>(json!(0)) },
        );
        let err = registry.register("Math", replacement).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateService(_)));
        assert!(err.to_string().contains("Math"));

        // Original registration still answers.
        let conn = make_connection();
        let result = registry
            .dispatch(&conn, "Math.Add", json!({"a": 1, "b": 1}))
            .await
            .unwrap();
        assert_eq!(result, json!(2));
    }

    #[test]
    fn empty_service_rejected() {
        let mut registry = Registry::new();
        let err = registry.register("Empty", Service::new()).unwrap_err();
        assert!(matches!(err, RegistryError::NoMethods(_)));
        assert!(err.to_string().contains("no methods"));
        assert!(registry.methods().is_empty());
    }

    #[tokio::test]
    async fn unknown_service_error_names_it() {
        let registry = Registry::new();
        let conn = make_connection();
        let err = registry
            .dispatch(&conn, "Foo.Bar", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), duplex_rpc::errors::METHOD_NOT_FOUND);
        assert!(err.to_string().contains("can't find service 'Foo.Bar'"));
    }

    #[tokio::test]
    async fn unknown_method_on_known_service() {
        let mut registry = Registry::new();
        registry.register("Math", math_service()).unwrap();

        let conn = make_connection();
        let err = registry
            .dispatch(&conn, "Math.Divide", Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("can't find method 'Math.Divide'"));
    }

    #[tokio::test]
    async fn ill_formed_name_rejected() {
        let mut registry = Registry::new();
        registry.register("Math", math_service()).unwrap();

        let conn = make_connection();
        let err = registry
            .dispatch(&conn, "nodot", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), duplex_rpc::errors::INVALID_REQUEST);
        assert!(err.to_string().contains("ill-formed"));
    }

    #[tokio::test]
    async fn decode_failure_is_invalid_params() {
        let mut registry = Registry::new();
        registry.register("Math", math_service()).unwrap();

        let conn = make_connection();
        let err = registry
            .dispatch(&conn, "Math.Add", json!({"a": "two"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), duplex_rpc::errors::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn handler_error_propagates_as_value() {
        let mut registry = Registry::new();
        let failing = Service::new().method(
            "Boom",
            |_conn: Arc<Connection>, _args: Value| async move {
                Err::<Value, _>(RpcError::Internal {
                    message: "boom".into(),
                })
            },
        );
        registry.register("Fail", failing).unwrap();

        let conn = make_connection();
        let err = registry
            .dispatch(&conn, "Fail.Boom", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), duplex_rpc::errors::INTERNAL_ERROR);
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn fallback_receives_unmatched_calls() {
        let mut registry = Registry::new();
        registry.register("Math", math_service()).unwrap();
        registry.register_fallback(
            |_conn: Arc<Connection>, method: String, params: Value| async move {
                Ok::<_, RpcError>(json!({"fallback": method, "params": params}))
            },
        );

        let conn = make_connection();
        let result = registry
            .dispatch(&conn, "No.Such", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result["fallback"], "No.Such");
        assert_eq!(result["params"]["x"], 1);

        // Registered methods are unaffected.
        let direct = registry
            .dispatch(&conn, "Math.Add", json!({"a": 2, "b": 2}))
            .await
            .unwrap();
        assert_eq!(direct, json!(4));
    }

    #[tokio::test]
    async fn middleware_wraps_every_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut registry = Registry::new();
        registry.register("Math", math_service()).unwrap();
        registry.register_middleware(
            move |_conn: Arc<Connection>, _method: String, params: Value, next: Next| {
                let seen = Arc::clone(&seen);
                async move {
                    let _ = seen.fetch_add(1, Ordering::SeqCst);
                    next(params).await
                }
            },
        );

        let conn = make_connection();
        let result = registry
            .dispatch(&conn, "Math.Add", json!({"a": 3, "b": 4}))
            .await
            .unwrap();
        assert_eq!(result, json!(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let mut registry = Registry::new();
        registry.register("Math", math_service()).unwrap();
        registry.register_middleware(
            |_conn: Arc<Connection>, method: String, params: Value, next: Next| async move {
                if method == "Math.Add" {
                    return Err(RpcError::Custom {
                        code: "FORBIDDEN".into(),
                        message: "not allowed".into(),
                        details: None,
                    });
                }
                next(params).await
            },
        );

        let conn = make_connection();
        let err = registry
            .dispatch(&conn, "Math.Add", json!({"a": 1, "b": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn middleware_wraps_fallback_too() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut registry = Registry::new();
        registry.register_fallback(
            |_conn: Arc<Connection>, _method: String, _params: Value| async move {
                Ok::<_, RpcError>(json!("fell back"))
            },
        );
        registry.register_middleware(
            move |_conn: Arc<Connection>, _method: String, params: Value, next: Next| {
                let seen = Arc::clone(&seen);
                async move {
                    let _ = seen.fetch_add(1, Ordering::SeqCst);
                    next(params).await
                }
            },
        );

        let conn = make_connection();
        let result = registry
            .dispatch(&conn, "No.Such", Value::Null)
            .await
            .unwrap();
        assert_eq!(result, json!("fell back"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn methods_listing_sorted() {
        let mut registry = Registry::new();
        let svc = Service::new()
            .method("B", |_conn: Arc<Connection>, _a: Value| async move {
                Ok::<_, RpcError>(json!(0))
            })
            .method("A", |_conn: Arc<Connection>, _a: Value| async move {
                Ok::<_, RpcError>(json!(0))
            });
        registry.register("Svc", svc).unwrap();

        assert_eq!(registry.methods(), vec!["Svc.A", "Svc.B"]);
        assert!(registry.has_method("Svc.A"));
        assert!(!registry.has_method("Svc.C"));
        assert!(!registry.has_method("nodot"));
    }

    #[test]
    fn service_len_and_default() {
        let svc = math_service();
        assert_eq!(svc.len(), 1);
        assert!(!svc.is_empty());
        assert!(Service::default().is_empty());
        assert!(Registry::default().methods().is_empty());
    }
}
