//! Onion middleware and group namespaces.
//!
//! Shared by [`Server`](crate::Server) groups (RPC handlers) and
//! [`MessageQueue`](crate::MessageQueue) groups (topic subscribers).
//!
//! # Onion Model
//!
//! ```text
//! A before ─► B before ─► handler ─► B after ─► A after
//! ```
//!
//! Each middleware receives the context and a [`Next`]. Calling
//! [`Next::run`] invokes the rest of the chain; whatever the middleware
//! does after awaiting it runs on the way out. `Next` is consumed by
//! `run`, so a middleware can delegate at most once per dispatch.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

// ============================================================================
// Types
// ============================================================================

/// Terminal handler at the center of the onion.
pub type Handler<C, R> = Arc<dyn Fn(C) -> BoxFuture<'static, R> + Send + Sync>;

/// One layer of the onion.
pub type Middleware<C, R> = Arc<dyn Fn(C, Next<C, R>) -> BoxFuture<'static, R> + Send + Sync>;

// ============================================================================
// Next
// ============================================================================

/// The remainder of a middleware chain.
pub struct Next<C, R> {
    chain: Arc<[Middleware<C, R>]>,
    index: usize,
    handler: Handler<C, R>,
}

impl<C, R> Next<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    /// Runs the next middleware, or the handler once the chain is exhausted.
    pub fn run(self, ctx: C) -> BoxFuture<'static, R> {
        match self.chain.get(self.index) {
            Some(layer) => {
                let layer = Arc::clone(layer);
                let next = Self {
                    chain: self.chain,
                    index: self.index + 1,
                    handler: self.handler,
                };
                layer(ctx, next)
            }
            None => (self.handler)(ctx),
        }
    }
}

// ============================================================================
// Composition
// ============================================================================

/// Wraps `handler` in `chain`, outermost first.
///
/// An empty chain returns the handler unchanged.
#[must_use]
pub fn compose<C, R>(chain: &[Middleware<C, R>], handler: Handler<C, R>) -> Handler<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    if chain.is_empty() {
        return handler;
    }

    let chain: Arc<[Middleware<C, R>]> = Arc::from(chain.to_vec());
    Arc::new(move |ctx| {
        Next {
            chain: Arc::clone(&chain),
            index: 0,
            handler: Arc::clone(&handler),
        }
        .run(ctx)
    })
}

/// Boxes an async closure into a [`Handler`].
pub fn handler_fn<C, R, F, Fut>(f: F) -> Handler<C, R>
where
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Boxes an async closure into a [`Middleware`].
///
/// # Example
///
/// ```ignore
/// let log = middleware_fn(|req: Request, next: Next<Request, Result<Value>>| async move {
///     tracing::debug!(action = %req.action, "before");
///     let out = next.run(req).await;
///     tracing::debug!("after");
///     out
/// });
/// ```
pub fn middleware_fn<C, R, F, Fut>(f: F) -> Middleware<C, R>
where
    F: Fn(C, Next<C, R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    Arc::new(move |ctx, next| f(ctx, next).boxed())
}

// ============================================================================
// Group Names
// ============================================================================

/// Normalizes a group name to end in exactly one `/`.
///
/// The empty name stays empty.
#[must_use]
pub fn normalize_group_name(name: &str) -> String {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    format!("{trimmed}/")
}

/// A namespace prefix plus its inherited middleware.
///
/// Deriving never mutates the parent: children copy the list.
#[derive(Clone)]
pub(crate) struct GroupPath<M> {
    name: String,
    middlewares: Vec<M>,
}

impl<M: Clone> GroupPath<M> {
    pub(crate) fn root(name: &str) -> Self {
        Self {
            name: normalize_group_name(name),
            middlewares: Vec::new(),
        }
    }

    pub(crate) fn child(&self, name: &str, middleware: Option<M>) -> Self {
        let mut middlewares = self.middlewares.clone();
        middlewares.extend(middleware);
        Self {
            name: format!("{}{}", self.name, normalize_group_name(name)),
            middlewares,
        }
    }

    pub(crate) fn with(&self, middleware: M) -> Self {
        self.child("", Some(middleware))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn middlewares(&self) -> &[M] {
        &self.middlewares
    }

    pub(crate) fn key(&self, leaf: &str) -> String {
        format!("{}{}", self.name, leaf)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use proptest::prelude::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &'static str) -> Middleware<u32, u32> {
        let log = Arc::clone(log);
        middleware_fn(move |ctx: u32, next: Next<u32, u32>| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}-before"));
                let out = next.run(ctx).await;
                log.lock().push(format!("{name}-after"));
                out
            }
        })
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log: Log = Arc::default();
        let handler_log = Arc::clone(&log);
        let handler = handler_fn(move |ctx: u32| {
            let log = Arc::clone(&handler_log);
            async move {
                log.lock().push("handler".to_string());
                ctx + 1
            }
        });

        let composed = compose(&[recording(&log, "A"), recording(&log, "B")], handler);
        assert_eq!(composed(1).await, 2);
        assert_eq!(
            *log.lock(),
            vec!["A-before", "B-before", "handler", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_middleware_can_short_circuit() {
        let block: Middleware<u32, u32> = middleware_fn(|_ctx, _next| async { 0 });
        let composed = compose(&[block], handler_fn(|ctx: u32| async move { ctx }));
        assert_eq!(composed(5).await, 0);
    }

    #[tokio::test]
    async fn test_middleware_sees_return_value() {
        let double: Middleware<u32, u32> =
            middleware_fn(|ctx, next: Next<u32, u32>| async move { next.run(ctx).await * 2 });
        let composed = compose(&[double], handler_fn(|ctx: u32| async move { ctx + 1 }));
        assert_eq!(composed(3).await, 8);
    }

    #[test]
    fn test_normalize_group_name() {
        assert_eq!(normalize_group_name(""), "");
        assert_eq!(normalize_group_name("g"), "g/");
        assert_eq!(normalize_group_name("g/"), "g/");
        assert_eq!(normalize_group_name("a/b"), "a/b/");
    }

    #[test]
    fn test_group_path_inheritance() {
        let root: GroupPath<&str> = GroupPath::root("api");
        let parent = root.child("user", Some("P"));
        let child = parent.child("profile/", Some("C"));

        assert_eq!(parent.name(), "api/user/");
        assert_eq!(child.name(), "api/user/profile/");
        assert_eq!(child.middlewares(), &["P", "C"]);
        assert_eq!(parent.middlewares(), &["P"]);
        assert_eq!(child.key("get"), "api/user/profile/get");
    }

    #[test]
    fn test_group_path_with_keeps_name() {
        let group: GroupPath<&str> = GroupPath::root("g");
        let used = group.with("M");
        assert_eq!(used.name(), "g/");
        assert_eq!(used.middlewares(), &["M"]);
        assert!(group.middlewares().is_empty());
    }

    proptest! {
        #[test]
        fn prop_trailing_slash_is_irrelevant(name in "[a-z]{1,8}(/[a-z]{1,8}){0,3}") {
            let with_slash = format!("{name}/");
            prop_assert_eq!(normalize_group_name(&name), normalize_group_name(&with_slash));
        }

        #[test]
        fn prop_normalize_is_idempotent(name in "[a-z/]{0,12}") {
            let once = normalize_group_name(&name);
            prop_assert_eq!(normalize_group_name(&once), once.clone());
            prop_assert!(once.is_empty() || (once.ends_with('/') && !once.ends_with("//")));
        }
    }
}
