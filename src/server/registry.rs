//! URI-pattern handler registry.
//!
//! Binds user-supplied request/websocket/authorization callbacks to URI
//! patterns and resolves the binding for an incoming request by longest
//! matching prefix, the same rule civetweb-style embeddable servers use for
//! `mg_set_request_handler`.

use crate::{
    http::{
        request::Request,
        response::{Handled, Response},
    },
    server::connection::ConnectionData,
    server::server_impl::Handler,
    ws::WebSocket,
    StatusCode,
};
use std::sync::{Arc, RwLock};

/// The three kinds of callback that can be bound to a URI pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Ordinary HTTP request handler.
    Request,
    /// WebSocket connect/ready/data/close handler.
    WebSocket,
    /// Pre-dispatch authorization handler, consulted before any other kind.
    Authorization,
}

struct Binding<H> {
    pattern: String,
    kind: HandlerKind,
    handler: Arc<H>,
}

/// Single-writer, many-reader URI matcher.
///
/// Lookups take a read lock and scan linearly for the longest matching
/// pattern; ties are broken by insertion order (first registered wins).
/// Mutation (`set`/`remove`) takes a write lock. `H` is the trait object
/// type handlers are stored as, e.g. `dyn Handler<S>`.
pub struct Registry<H: ?Sized> {
    bindings: RwLock<Vec<Binding<H>>>,
}

impl<H: ?Sized> Registry<H> {
    pub(crate) fn new() -> Self {
        Self {
            bindings: RwLock::new(Vec::new()),
        }
    }

    /// Binds `handler` to `pattern` for the given kind. A pre-existing
    /// binding with the same `(pattern, kind)` is replaced in place so
    /// insertion order (and therefore tie-breaking) is preserved.
    pub(crate) fn set(&self, pattern: &str, kind: HandlerKind, handler: Arc<H>) {
        let mut guard = self.bindings.write().expect("registry lock poisoned");

        match guard.iter_mut().find(|b| b.pattern == pattern && b.kind == kind) {
            Some(existing) => existing.handler = handler,
            None => guard.push(Binding {
                pattern: pattern.to_string(),
                kind,
                handler,
            }),
        }
    }

    /// Removes the binding for `pattern`/`kind`, if any (NULL-handler semantics).
    #[allow(dead_code)]
    pub(crate) fn remove(&self, pattern: &str, kind: HandlerKind) {
        let mut guard = self.bindings.write().expect("registry lock poisoned");
        guard.retain(|b| !(b.pattern == pattern && b.kind == kind));
    }

    /// Finds the longest-matching binding of `kind` for `local_uri`.
    ///
    /// A pattern matches when:
    /// - it equals `local_uri` exactly, or
    /// - it has no trailing `/` and `local_uri` starts with `pattern` + `/`, or
    /// - it ends with `/` and `local_uri` starts with `pattern`.
    ///
    /// Ties (same matched length) are broken by earliest insertion.
    pub(crate) fn find(&self, local_uri: &str, kind: HandlerKind) -> Option<Arc<H>> {
        let guard = self.bindings.read().expect("registry lock poisoned");

        let mut best: Option<(usize, &Binding<H>)> = None;
        for binding in guard.iter().filter(|b| b.kind == kind) {
            let matches = binding.pattern == local_uri
                || (!binding.pattern.ends_with('/')
                    && local_uri.len() > binding.pattern.len()
                    && local_uri.starts_with(&binding.pattern)
                    && local_uri.as_bytes()[binding.pattern.len()] == b'/')
                || (binding.pattern.ends_with('/') && local_uri.starts_with(&binding.pattern));

            if matches {
                let len = binding.pattern.len();
                if best.is_none_or(|(best_len, _)| len > best_len) {
                    best = Some((len, binding));
                }
            }
        }

        best.map(|(_, binding)| binding.handler.clone())
    }
}

/// Object-safe counterpart of [`Handler`](crate::Handler), storable behind
/// `Arc<dyn RequestHandler<S>>` inside a [`Registry`].
///
/// [`Handler`](crate::Handler) itself can't be used as a trait object because
/// it's defined with native `async fn`; this trait is the `async-trait`
/// wrapper used only where dynamic dispatch by URI pattern is required.
#[async_trait::async_trait]
pub trait RequestHandler<S: ConnectionData = ()>: Sync + Send + 'static {
    async fn handle(&self, connection_data: &mut S, request: &Request, response: &mut Response) -> Handled;
}

struct FnRequestHandler<S, H> {
    handler: H,
    _marker: std::marker::PhantomData<fn(&mut S)>,
}

#[async_trait::async_trait]
impl<S, H> RequestHandler<S> for FnRequestHandler<S, H>
where
    S: ConnectionData,
    H: Handler<S>,
{
    async fn handle(&self, connection_data: &mut S, request: &Request, response: &mut Response) -> Handled {
        self.handler.handle(connection_data, request, response).await
    }
}

/// Object-safe WebSocket handler, storable behind `Arc<dyn WebSocketHandler<S>>`
/// inside a [`Registry`] and bound to a URI pattern via [`Router::websocket`].
///
/// The original civetweb-style `{connect, ready, data, close}` four-callback
/// shape collapses to one stage here: by the time `handle` runs, the upgrade
/// handshake has already completed, and the handler owns the connection
/// until it returns (or the peer closes it).
#[async_trait::async_trait]
pub trait WebSocketHandler<S: ConnectionData = ()>: Sync + Send + 'static {
    async fn handle(&self, connection_data: &mut S, request: &Request, socket: &mut WebSocket<'_>);
}

/// Routes requests to handlers bound by URI pattern, falling back to 404
/// when nothing matches.
///
/// Wraps a [`Registry`] of [`RequestHandler`]s so it can itself be installed
/// as the server's single [`Handler`](crate::Handler), turning the
/// single-handler server into a multi-route one. Authorization handlers
/// registered under [`HandlerKind::Authorization`] run first and can reject
/// the request before the matched [`HandlerKind::Request`] handler runs.
/// WebSocket handlers live in a separate registry, since their callback
/// shape (raw [`WebSocket`] session, not a [`Response`]) differs from
/// ordinary request handlers.
pub struct Router<S: ConnectionData = ()> {
    registry: Registry<dyn RequestHandler<S>>,
    ws_registry: Registry<dyn WebSocketHandler<S>>,
}

impl<S: ConnectionData> Default for Router<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ConnectionData> Router<S> {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            ws_registry: Registry::new(),
        }
    }

    /// Binds a plain [`Handler`](crate::Handler) implementation to `pattern`.
    pub fn route<H: Handler<S>>(self, pattern: &str, handler: H) -> Self {
        self.registry.set(
            pattern,
            HandlerKind::Request,
            Arc::new(FnRequestHandler {
                handler,
                _marker: std::marker::PhantomData,
            }),
        );
        self
    }

    /// Binds an authorization handler to `pattern`, consulted before the
    /// matching request handler.
    pub fn authorize<H: Handler<S>>(self, pattern: &str, handler: H) -> Self {
        self.registry.set(
            pattern,
            HandlerKind::Authorization,
            Arc::new(FnRequestHandler {
                handler,
                _marker: std::marker::PhantomData,
            }),
        );
        self
    }

    /// Binds a [`WebSocketHandler`] to `pattern`. A request whose path
    /// matches and which carries an `Upgrade: websocket` header enters the
    /// upgrade handshake instead of ordinary request dispatch.
    pub fn websocket<H: WebSocketHandler<S>>(self, pattern: &str, handler: H) -> Self {
        self.ws_registry.set(pattern, HandlerKind::WebSocket, Arc::new(handler));
        self
    }

    pub(crate) fn find_websocket(&self, local_uri: &str) -> Option<Arc<dyn WebSocketHandler<S>>> {
        self.ws_registry.find(local_uri, HandlerKind::WebSocket)
    }
}

impl<S: ConnectionData> Handler<S> for Router<S> {
    async fn handle(&self, connection_data: &mut S, request: &Request, response: &mut Response) -> Handled {
        let local_uri = String::from_utf8_lossy(request.url().path());

        if let Some(auth) = self.registry.find(&local_uri, HandlerKind::Authorization) {
            let handled = auth.handle(connection_data, request, response).await;
            if response.is_complete() {
                return handled;
            }
        }

        match self.registry.find(&local_uri, HandlerKind::Request) {
            Some(handler) => handler.handle(connection_data, request, response).await,
            None => response.status(StatusCode::NotFound).body("Not found"),
        }
    }

    fn websocket_for(&self, request: &Request) -> Option<Arc<dyn WebSocketHandler<S>>> {
        let local_uri = String::from_utf8_lossy(request.url().path());
        self.find_websocket(&local_uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let reg: Registry<u32> = Registry::new();
        reg.set("/api", HandlerKind::Request, Arc::new(1));
        reg.set("/api/users", HandlerKind::Request, Arc::new(2));

        assert_eq!(reg.find("/api/users/123", HandlerKind::Request).map(|h| *h), Some(2));
        assert_eq!(reg.find("/api/orders", HandlerKind::Request).map(|h| *h), Some(1));
        assert_eq!(reg.find("/other", HandlerKind::Request), None);
    }

    #[test]
    fn exact_match_without_trailing_slash_requires_boundary() {
        let reg: Registry<u32> = Registry::new();
        reg.set("/api", HandlerKind::Request, Arc::new(1));

        assert_eq!(reg.find("/api", HandlerKind::Request).map(|h| *h), Some(1));
        assert_eq!(reg.find("/apix", HandlerKind::Request), None);
        assert_eq!(reg.find("/api/", HandlerKind::Request).map(|h| *h), Some(1));
    }

    #[test]
    fn trailing_slash_pattern_matches_prefix_without_boundary() {
        let reg: Registry<u32> = Registry::new();
        reg.set("/static/", HandlerKind::Request, Arc::new(1));

        assert_eq!(reg.find("/staticfile", HandlerKind::Request).map(|h| *h), Some(1));
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let reg: Registry<u32> = Registry::new();
        reg.set("/api", HandlerKind::Request, Arc::new(1));
        reg.set("/api", HandlerKind::Request, Arc::new(2));

        assert_eq!(reg.find("/api", HandlerKind::Request).map(|h| *h), Some(2));
    }

    #[test]
    fn remove_deletes_exact_binding() {
        let reg: Registry<u32> = Registry::new();
        reg.set("/api", HandlerKind::Request, Arc::new(1));
        reg.remove("/api", HandlerKind::Request);

        assert_eq!(reg.find("/api", HandlerKind::Request), None);
    }

    #[test]
    fn kinds_are_independent() {
        let reg: Registry<u32> = Registry::new();
        reg.set("/ws", HandlerKind::WebSocket, Arc::new(1));

        assert_eq!(reg.find("/ws", HandlerKind::Request), None);
        assert_eq!(reg.find("/ws", HandlerKind::WebSocket).map(|h| *h), Some(1));
    }

    struct EchoWs;

    #[async_trait::async_trait]
    impl WebSocketHandler<()> for EchoWs {
        async fn handle(&self, _: &mut (), _: &Request, _: &mut WebSocket<'_>) {}
    }

    struct NoOp;

    impl Handler for NoOp {
        async fn handle(&self, _: &mut (), _: &Request, r: &mut Response) -> Handled {
            r.status(StatusCode::Ok).body("")
        }
    }

    #[test]
    fn router_websocket_binding_is_independent_of_request_binding() {
        let router: Router = Router::new().route("/chat", NoOp).websocket("/chat", EchoWs);

        assert!(router.find_websocket("/chat").is_some());
        assert!(router.find_websocket("/other").is_none());
    }
}
