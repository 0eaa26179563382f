//! The HTTP server accept loop.

use crate::{
    http::{request::RequestParser, response::Response, router::Router},
    limits::HttpLimits,
    Request,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// The boundary through which a security or policy component may reject a
/// request before routing.
///
/// Returning `false` means the filter has already decided the response; the
/// router never runs. Implementations must be concurrency-safe; the filter
/// is shared across every connection task.
pub trait PreFilter: Send + Sync + 'static {
    fn filter(&self, request: &Request, response: &mut Response) -> bool;
}

impl<F> PreFilter for F
where
    F: Fn(&Request, &mut Response) -> bool + Send + Sync + 'static,
{
    fn filter(&self, request: &Request, response: &mut Response) -> bool {
        self(request, response)
    }
}

/// An HTTP/1.1 server that answers one request per connection
/// (`Connection: close`) on lightweight per-connection tasks.
///
/// # Examples
///
/// ```no_run
/// use ember_web::{HttpServer, Request, Response, Router};
///
/// #[tokio::main]
/// async fn main() {
///     let mut router = Router::new();
///     router.get("/hello", |req: &Request, resp: &mut Response| {
///         Box::pin(async move {
///             let name = req.query_param("name").unwrap_or("world");
///             resp.ok().body(format!("hi {name}"));
///             Ok(())
///         })
///     });
///
///     HttpServer::builder()
///         .router(router)
///         .port(8080)
///         .launch()
///         .await
///         .unwrap();
/// }
/// ```
pub struct HttpServer {
    listener: Option<TcpListener>,
    router: Arc<Router>,
    pre_filter: Option<Arc<dyn PreFilter>>,
    limits: HttpLimits,
}

impl HttpServer {
    /// Creates a new builder for configuring the server instance.
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder {
            listener: None,
            router: None,
            pre_filter: None,
            limits: HttpLimits::default(),
        }
    }

    /// Starts accepting connections. Runs until the accept loop fails
    /// fatally; per-connection errors are logged and never fatal.
    pub async fn launch(self) -> io::Result<()> {
        let listener = match self.listener {
            Some(listener) => listener,
            None => TcpListener::bind(("0.0.0.0", self.limits.port)).await?,
        };
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "HTTP server started");

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "error accepting connection");
                    continue;
                }
            };

            let router = self.router.clone();
            let pre_filter = self.pre_filter.clone();
            let limits = self.limits.clone();

            tokio::spawn(async move {
                handle_connection(stream, addr, router, pre_filter, &limits).await;
            });
        }
    }
}

/// One connection: parse → pre-filter → route → serialize → close.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    router: Arc<Router>,
    pre_filter: Option<Arc<dyn PreFilter>>,
    limits: &HttpLimits,
) {
    let response = match RequestParser::parse(&mut stream, limits).await {
        Ok(mut request) => {
            debug!(%addr, method = %request.method(), path = request.path(), "request");
            let mut response = Response::new();

            let allowed = pre_filter
                .map(|filter| filter.filter(&request, &mut response))
                .unwrap_or(true);
            if allowed {
                router.handle(&mut request, &mut response).await;
            }
            response
        }
        Err(kind) => {
            warn!(%addr, error = %kind, "rejecting request");
            kind.to_response()
        }
    };

    // Serialization or socket-write failures are logged only; there is no
    // recovery path once the response is being emitted.
    if let Err(err) = stream.write_all(&response.to_bytes()).await {
        error!(%addr, error = %err, "error writing response");
    }
    let _ = stream.shutdown().await;
}

/// Builder for configuring and creating [`HttpServer`] instances.
pub struct HttpServerBuilder {
    listener: Option<TcpListener>,
    router: Option<Router>,
    pre_filter: Option<Arc<dyn PreFilter>>,
    limits: HttpLimits,
}

impl HttpServerBuilder {
    /// Sets the port bound at launch (default `8080`). Ignored when an
    /// explicit listener is supplied.
    pub fn port(mut self, port: u16) -> Self {
        self.limits.port = port;
        self
    }

    /// Supplies an already-bound listener instead of a port.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the router. **This is a required component.**
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Installs a pre-filter that runs between parsing and routing.
    pub fn pre_filter<F: PreFilter>(mut self, filter: F) -> Self {
        self.pre_filter = Some(Arc::new(filter));
        self
    }

    /// Overrides the parsing limits (including the port).
    pub fn limits(mut self, limits: HttpLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Finalizes the builder.
    ///
    /// # Panics
    /// Panics when no router was supplied.
    #[track_caller]
    pub fn build(self) -> HttpServer {
        HttpServer {
            listener: self.listener,
            router: Arc::new(self.router.expect("The `router` method must be called to create")),
            pre_filter: self.pre_filter,
            limits: self.limits,
        }
    }

    /// Shorthand for `build().launch()`.
    pub async fn launch(self) -> io::Result<()> {
        self.build().launch().await
    }
}
