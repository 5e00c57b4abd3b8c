//! Request dispatch: the in-memory registry mapping `(method, path)` to handlers.
//!
//! Routes are registered with ordinary calls at startup. Three pattern styles are
//! supported:
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "/docs/readme.txt"` |
//!
//! Trailing slashes are normalized on both patterns and incoming paths. Routes are
//! matched in registration order. A path that matches only routes registered for
//! other methods resolves to `405 Method Not Allowed` rather than `404`.

use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::{Method, Request, Response, StatusCode};

/// Error type handlers may return; surfaced to the client as a 500 response.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// What a handler invocation produces.
pub type HandlerResult = Result<Response, BoxError>;

/// Boxed, `'static` future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

/// Type-erased async handler.
///
/// In practice you never construct this type directly; use [`Registry::get`],
/// [`Registry::post`], and the other method-specific helpers instead.
pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync + 'static>;

/// Values a handler may resolve to: a [`Response`], or a `Result` whose error
/// becomes a 500.
pub trait IntoHandlerResult {
    fn into_handler_result(self) -> HandlerResult;
}

impl IntoHandlerResult for Response {
    fn into_handler_result(self) -> HandlerResult {
        Ok(self)
    }
}

impl<E> IntoHandlerResult for Result<Response, E>
where
    E: Into<BoxError>,
{
    fn into_handler_result(self) -> HandlerResult {
        self.map_err(Into::into)
    }
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled form of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Parameterized { segments: Vec<Segment> },
    // Prefix without the trailing `/*`.
    Wildcard(String),
}

// Strips one trailing slash, keeping the root path intact.
fn normalize(path: &str) -> &str {
    if path != "/" {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

impl Pattern {
    /// Classifies a pattern: a `/*` suffix makes a wildcard, any `:` makes a
    /// parameterized pattern, anything else matches literally.
    fn parse(pattern: &str) -> Self {
        let pattern = normalize(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Self::Wildcard(prefix.to_string());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_string()),
                    None => Segment::Static(s.to_string()),
                })
                .collect();
            return Self::Parameterized { segments };
        }

        Self::Exact(pattern.to_string())
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let path = normalize(path);

        match self {
            Self::Exact(p) => (p == path).then(PathParams::new),
            Self::Parameterized { segments } => {
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.len() != path_segments.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => {
                            params.insert(name.clone(), path_seg.to_string());
                        }
                    }
                }
                Some(params)
            }
            Self::Wildcard(prefix) => {
                let suffix = path.strip_prefix(prefix.as_str())?;
                // `/files/*` must not match `/filesystem`.
                if !suffix.is_empty() && !suffix.starts_with('/') {
                    return None;
                }
                let mut params = PathParams::new();
                params.insert("wildcard".to_string(), suffix.to_string());
                Some(params)
            }
        }
    }
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

/// Outcome of looking up a request in the [`Registry`].
pub enum Resolution {
    Found { handler: Handler, params: PathParams },
    NotFound,
    /// The path exists under other methods, listed in registration order.
    MethodNotAllowed { allowed: Vec<Method> },
}

/// Registry of handlers, built once at startup and shared by all connections.
///
/// # Examples
///
/// ```rust,no_run
/// use pipehttp::{Registry, Response, StatusCode};
///
/// let mut registry = Registry::new();
///
/// registry.get("/ping", |_ctx| async { Response::new(StatusCode::Ok) });
///
/// registry.get("/users/:id", |ctx| async move {
///     let id = ctx.params().get("id").unwrap_or("unknown").to_owned();
///     Response::new(StatusCode::Ok).body(id)
/// });
/// ```
#[derive(Default)]
pub struct Registry {
    routes: Vec<Route>,
}

impl Registry {
    /// Create a new, empty `Registry`.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a handler for `GET` requests matching `path`.
    pub fn get<H, F, R>(&mut self, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.register(Method::Get, path, handler);
    }

    /// Register a handler for `POST` requests matching `path`.
    pub fn post<H, F, R>(&mut self, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.register(Method::Post, path, handler);
    }

    /// Register a handler for `PUT` requests matching `path`.
    pub fn put<H, F, R>(&mut self, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.register(Method::Put, path, handler);
    }

    /// Register a handler for `DELETE` requests matching `path`.
    pub fn delete<H, F, R>(&mut self, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.register(Method::Delete, path, handler);
    }

    /// Register a handler for `PATCH` requests matching `path`.
    pub fn patch<H, F, R>(&mut self, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.register(Method::Patch, path, handler);
    }

    /// Register a handler for `OPTIONS` requests matching `path`.
    pub fn options<H, F, R>(&mut self, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.register(Method::Options, path, handler);
    }

    /// Register a handler for any method, including extension methods.
    pub fn register<H, F, R>(&mut self, method: Method, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        let handler: Handler = Arc::new(move |ctx| {
            let fut = handler(ctx);
            Box::pin(async move { fut.await.into_handler_result() }) as HandlerFuture
        });
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler,
        });
    }

    /// Return the number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Looks up the handler for `method` and `path`.
    pub fn resolve(&self, method: &Method, path: &str) -> Resolution {
        let mut allowed: Vec<Method> = Vec::new();

        for route in &self.routes {
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };
            if &route.method == method {
                return Resolution::Found {
                    handler: Arc::clone(&route.handler),
                    params,
                };
            }
            if !allowed.contains(&route.method) {
                allowed.push(route.method.clone());
            }
        }

        if allowed.is_empty() {
            Resolution::NotFound
        } else {
            Resolution::MethodNotAllowed { allowed }
        }
    }

    /// Resolves `request` and starts its handler.
    ///
    /// The returned future owns everything it needs, so it can run on any
    /// task. Unmatched requests resolve to `404` or `405` without invoking a
    /// handler.
    pub fn dispatch(&self, request: Request) -> HandlerFuture {
        match self.resolve(request.method(), request.path()) {
            Resolution::Found { handler, params } => handler(Context::with_params(request, params)),
            Resolution::NotFound => {
                Box::pin(async { Ok::<_, BoxError>(Response::new(StatusCode::NotFound)) })
            }
            Resolution::MethodNotAllowed { allowed } => {
                let allow = allowed
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                let response = Response::new(StatusCode::MethodNotAllowed).header("Allow", allow);
                Box::pin(async move { Ok::<_, BoxError>(response) })
            }
        }
    }
}
