//! Path-parameterized routing with middleware chaining and error dispatch.

use crate::{
    errors::HandlerError,
    http::{request::Request, response::Response, types::Method},
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::error;

/// The future a route handler returns.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// An async route handler. Wrap the body in `Box::pin(async move { … })`.
pub type RouteHandler =
    Arc<dyn for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync>;

/// A pre-handler callback; returning `false` means the response is already
/// decided and dispatch stops.
pub type Middleware = Arc<dyn Fn(&Request, &mut Response) -> bool + Send + Sync>;

/// Selects which [`HandlerError`]s an error responder takes over.
pub type ErrorPredicate = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// An error responder; it fully owns the response once selected.
pub type ErrorResponder = Arc<dyn Fn(&HandlerError, &Request, &mut Response) + Send + Sync>;

enum Segment {
    Literal(String),
    Param(String),
}

/// A registered route: the original pattern, its compiled matcher, the
/// parameter names in capture order, the handler, and the method set.
pub struct Route {
    pattern: String,
    segments: Vec<Segment>,
    param_names: Vec<String>,
    methods: HashSet<Method>,
    handler: RouteHandler,
}

impl Route {
    /// Compiles a pattern: split on `/`, skip empty segments; `:name`
    /// becomes a single-segment capture, anything else a literal. The
    /// matcher is anchored at both ends.
    fn compile(method: Method, pattern: &str, handler: RouteHandler) -> Self {
        let mut segments = Vec::new();
        let mut param_names = Vec::new();

        for part in pattern.split('/') {
            if let Some(name) = part.strip_prefix(':') {
                param_names.push(name.to_string());
                segments.push(Segment::Param(name.to_string()));
            } else if !part.is_empty() {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Self {
            pattern: pattern.to_string(),
            segments,
            param_names,
            methods: HashSet::from([method]),
            handler,
        }
    }

    /// Anchored match against a path. Returns the captured parameters in
    /// pattern order, or `None` on mismatch. Captures never span a `/` and
    /// never match empty.
    fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        if self.segments.is_empty() {
            return (path == "/").then(Vec::new);
        }

        let mut captures = Vec::with_capacity(self.param_names.len());
        let mut pos = 0;

        for segment in &self.segments {
            if !path[pos..].starts_with('/') {
                return None;
            }
            pos += 1;

            let end = path[pos..]
                .find('/')
                .map(|i| pos + i)
                .unwrap_or(path.len());
            let text = &path[pos..end];
            if text.is_empty() {
                return None;
            }

            match segment {
                Segment::Literal(expected) => {
                    if expected != text {
                        return None;
                    }
                }
                Segment::Param(name) => captures.push((name.clone(), text.to_string())),
            }
            pos = end;
        }

        (pos == path.len()).then_some(captures)
    }

    #[inline(always)]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[inline(always)]
    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    #[inline(always)]
    pub fn methods(&self) -> &HashSet<Method> {
        &self.methods
    }
}

/// The request dispatcher.
///
/// Registration happens at setup; afterwards the router is shared read-only
/// across connection tasks. Dispatch order: middleware (registration order,
/// `false` short-circuits) → the method's route list (registration order,
/// first match wins, no specificity ranking) to the handler, with errors
/// through the `(predicate, responder)` pairs in insertion order.
///
/// # Examples
/// ```
/// use ember_web::{Request, Response, Router};
///
/// let mut router = Router::new();
/// router.get("/users/:id", |req: &Request, resp: &mut Response| {
///     Box::pin(async move {
///         let id = req.path_param("id").unwrap_or("?");
///         resp.ok().body(format!("user {id}"));
///         Ok(())
///     })
/// });
/// ```
#[derive(Default)]
pub struct Router {
    routes: HashMap<Method, Vec<Route>>,
    middleware: Vec<Middleware>,
    error_handlers: Vec<(ErrorPredicate, ErrorResponder)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route for `method`.
    pub fn route<F>(&mut self, method: Method, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        let route = Route::compile(method, pattern, Arc::new(handler));
        self.routes.entry(method).or_default().push(route);
        self
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.route(Method::Get, pattern, handler)
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.route(Method::Post, pattern, handler)
    }

    pub fn put<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.route(Method::Put, pattern, handler)
    }

    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.route(Method::Delete, pattern, handler)
    }

    pub fn patch<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.route(Method::Patch, pattern, handler)
    }

    pub fn head<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.route(Method::Head, pattern, handler)
    }

    pub fn options<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.route(Method::Options, pattern, handler)
    }

    /// Registers a middleware callback; they run before routing in
    /// registration order.
    pub fn middleware<F>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(&Request, &mut Response) -> bool + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Registers an error responder for the handler errors `predicate`
    /// accepts. Pairs are tried in insertion order; the first match takes
    /// the response over.
    pub fn on_error<P, F>(&mut self, predicate: P, responder: F) -> &mut Self
    where
        P: Fn(&HandlerError) -> bool + Send + Sync + 'static,
        F: Fn(&HandlerError, &Request, &mut Response) + Send + Sync + 'static,
    {
        self.error_handlers
            .push((Arc::new(predicate), Arc::new(responder)));
        self
    }

    /// Dispatches one request.
    pub async fn handle(&self, request: &mut Request, response: &mut Response) {
        for middleware in &self.middleware {
            if !middleware(request, response) {
                return;
            }
        }

        let matched = self.routes.get(&request.method()).and_then(|routes| {
            routes
                .iter()
                .find_map(|route| route.matches(request.path()).map(|caps| (route, caps)))
        });

        let Some((route, captures)) = matched else {
            response.not_found().body("404 Not Found");
            return;
        };

        request.set_path_params(captures.into_iter().collect());

        if let Err(err) = (route.handler)(request, response).await {
            self.dispatch_error(&err, request, response);
        }
    }

    fn dispatch_error(&self, err: &HandlerError, request: &Request, response: &mut Response) {
        error!(
            method = %request.method(),
            path = %request.path(),
            error = %err,
            "handler error"
        );

        for (predicate, responder) in &self.error_handlers {
            if predicate(err) {
                responder(err, request, response);
                return;
            }
        }

        Self::default_error_response(err, request, response);
    }

    /// The built-in 500 page used when no registered pair matches.
    fn default_error_response(err: &HandlerError, request: &Request, response: &mut Response) {
        response.internal_error().html(format!(
            "<!DOCTYPE html>\n\
             <html>\n\
             <head><title>500 Internal Server Error</title></head>\n\
             <body>\n\
                 <h1>500 - Internal Server Error</h1>\n\
                 <p>An unexpected error occurred while processing your request.</p>\n\
                 <div class=\"error-details\">\n\
                     <strong>Error:</strong> {}<br>\n\
                     <strong>Path:</strong> {}<br>\n\
                     <strong>Method:</strong> {}\n\
                 </div>\n\
             </body>\n\
             </html>\n",
            err,
            request.path(),
            request.method()
        ));
    }

    /// Number of registered routes across all methods.
    pub fn route_count(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod compile_tests {
    use super::*;

    fn noop<'a>(_req: &'a Request, _resp: &'a mut Response) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn compiled(pattern: &str) -> Route {
        Route::compile(Method::Get, pattern, Arc::new(noop))
    }

    #[test]
    fn param_names_in_order_and_count() {
        #[rustfmt::skip]
        let cases = [
            ("/users/:id",                vec!["id"]),
            ("/users/:uid/posts/:pid",    vec!["uid", "pid"]),
            ("/static/css",               vec![]),
            ("/",                         vec![]),
            ("//a//:b//",                 vec!["b"]),
        ];

        for (pattern, names) in cases {
            let route = compiled(pattern);
            assert_eq!(route.param_names(), names.as_slice(), "{pattern}");
            // capture count always equals the parameter-name count
            if let Some(caps) = route.matches(&sample_path_for(pattern)) {
                assert_eq!(caps.len(), names.len());
            }
        }
    }

    fn sample_path_for(pattern: &str) -> String {
        let mut out = String::new();
        for part in pattern.split('/').filter(|p| !p.is_empty()) {
            out.push('/');
            out.push_str(if part.starts_with(':') { "x" } else { part });
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    #[test]
    fn matching() {
        #[rustfmt::skip]
        let cases = [
            ("/users/:id",  "/users/123",      Some(vec![("id", "123")])),
            ("/users/:id",  "/users/123/",     None),
            ("/users/:id",  "/users",          None),
            ("/users/:id",  "/users/123/go",   None),
            ("/users/:id",  "/posts/123",      None),
            ("/users/:id",  "/users//123",     None),
            ("/api/health", "/api/health",     Some(vec![])),
            ("/api/health", "/api/healthz",    None),
            ("/",           "/",               Some(vec![])),
            ("/",           "/x",              None),
            ("/a/:b/c",     "/a/zzz/c",        Some(vec![("b", "zzz")])),
        ];

        for (pattern, path, expected) in cases {
            let got = compiled(pattern).matches(path);
            let expected: Option<Vec<(String, String)>> = expected.map(|caps| {
                caps.into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            });
            assert_eq!(got, expected, "{pattern} vs {path}");
        }
    }
}
