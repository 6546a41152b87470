//! # Middleware
//!
//! Injection of model accessors into a host request context. The pipeline
//! types are generic over the context `C` and the result `R`, so any chain
//! that passes a context to a continuation and awaits its output can carry
//! [`OdmMiddleware`].
//!
//! The accessors resolve models on Tokio tasks: the host chain has to run
//! inside a Tokio runtime, whichever framework drives it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::OdmResult;
use crate::model::{Document, Model};
use crate::registry::ModelRegistry;

pub type ModelFuture = BoxFuture<'static, OdmResult<Model>>;
pub type DocumentFuture = BoxFuture<'static, OdmResult<Document>>;

type ModelFn = dyn Fn(&str) -> ModelFuture + Send + Sync;
type DocumentFn = dyn Fn(&str, Value) -> DocumentFuture + Send + Sync;

/// The two closures attached to a request context, both bound to one registry.
/// Their futures must be awaited inside a Tokio runtime.
#[derive(Clone)]
pub struct ModelAccessors {
    model: Arc<ModelFn>,
    document: Arc<DocumentFn>,
}

impl ModelAccessors {
    pub(crate) fn from_registry(registry: ModelRegistry) -> Self {
        let for_models = registry.clone();
        let model = move |name: &str| -> ModelFuture {
            let registry = for_models.clone();
            let name = name.to_string();
            Box::pin(async move { registry.get_model(&name).await })
        };
        let document = move |name: &str, attributes: Value| -> DocumentFuture {
            let registry = registry.clone();
            let name = name.to_string();
            Box::pin(async move { registry.document(&name, attributes).await })
        };

        Self {
            model: Arc::new(model),
            document: Arc::new(document),
        }
    }

    /// Resolve a model by qualified name
    pub fn model(&self, name: &str) -> ModelFuture {
        (self.model)(name)
    }

    /// Build an unsaved document of the named model
    pub fn document(&self, name: &str, attributes: Value) -> DocumentFuture {
        (self.document)(name, attributes)
    }
}

impl fmt::Debug for ModelAccessors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ModelAccessors")
    }
}

/// A host context that can carry model accessors
pub trait ModelContext {
    fn attach_models(&mut self, accessors: ModelAccessors);
}

pub type NextFuture<R> = BoxFuture<'static, R>;

/// The rest of the middleware chain
pub struct Next<C, R> {
    handler: Box<dyn FnOnce(C) -> NextFuture<R> + Send>,
}

impl<C, R> Next<C, R> {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnOnce(C) -> NextFuture<R> + Send + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Run the rest of the chain with `context`
    pub async fn run(self, context: C) -> R {
        (self.handler)(context).await
    }
}

impl<C, R> fmt::Debug for Next<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Next")
    }
}

/// Middleware with the `handle(context, next)` calling convention.
///
/// Framework-agnostic, but [`OdmMiddleware`]'s accessors need a Tokio runtime
/// when they are awaited.
pub trait Middleware<C, R>: Send + Sync + fmt::Debug {
    fn handle(&self, context: C, next: Next<C, R>) -> NextFuture<R>;

    fn name(&self) -> &'static str {
        "Middleware"
    }
}

/// Ordered middleware chain ending in a handler
pub struct MiddlewarePipeline<C, R> {
    middleware: Vec<Arc<dyn Middleware<C, R>>>,
}

impl<C, R> Default for MiddlewarePipeline<C, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, R> Clone for MiddlewarePipeline<C, R> {
    fn clone(&self) -> Self {
        Self {
            middleware: self.middleware.clone(),
        }
    }
}

impl<C, R> MiddlewarePipeline<C, R> {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    pub fn add<M: Middleware<C, R> + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }
}

impl<C, R> MiddlewarePipeline<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    /// Run `context` through every middleware, first added first, then `handler`
    pub async fn execute<F, Fut>(&self, context: C, handler: F) -> R
    where
        F: FnOnce(C) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let mut chain = Box::new(move |ctx: C| Box::pin(handler(ctx)) as NextFuture<R>)
            as Box<dyn FnOnce(C) -> NextFuture<R> + Send>;

        for middleware in self.middleware.iter().rev() {
            let middleware = Arc::clone(middleware);
            let next_handler = chain;
            chain = Box::new(move |ctx: C| middleware.handle(ctx, Next::new(next_handler)));
        }

        chain(context).await
    }
}

impl<C, R> fmt::Debug for MiddlewarePipeline<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("middleware", &self.names())
            .finish()
    }
}

/// Attaches [`ModelAccessors`] to the context, then always continues the chain
/// and returns its result untouched
#[derive(Debug, Clone)]
pub struct OdmMiddleware {
    accessors: ModelAccessors,
}

impl OdmMiddleware {
    pub fn new(accessors: ModelAccessors) -> Self {
        Self { accessors }
    }
}

impl<C, R> Middleware<C, R> for OdmMiddleware
where
    C: ModelContext + Send + 'static,
    R: Send + 'static,
{
    fn handle(&self, mut context: C, next: Next<C, R>) -> NextFuture<R> {
        tracing::trace!("Attaching model accessors to context");
        context.attach_models(self.accessors.clone());
        Box::pin(next.run(context))
    }

    fn name(&self) -> &'static str {
        "OdmMiddleware"
    }
}
