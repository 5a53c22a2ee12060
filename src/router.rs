//! Radix tree routing.
//!
//! Patterns are split on `/` into segments. Each segment is one of:
//!
//! * a literal, matched exactly (or case insensitively, see [`Router::case_sensitive`]),
//! * `:name`, matching any single segment and capturing it as a parameter. A trailing `?`
//!   (`:name?`) makes the parameter optional,
//! * `*` (or `*name`), matching the rest of the path, which must not be empty. Only valid as the
//!   last segment.
//!
//! Lookup prefers literals over parameters over wildcards and backtracks, so `/files/:id/meta`
//! and `/files/*` can coexist. HTTP handlers are registered per [`Method`], with
//! [`Method::Any`] as the fallback when no method specific handler exists on the matched node.
//! WebSocket handlers live in the same tree.
//!
//! ```
//! use evhttpd::connection::Method;
//! use evhttpd::error::HttpError;
//! use evhttpd::request::Request;
//! use evhttpd::router::Router;
//!
//! let mut router = Router::new();
//! router
//!     .get("/users/:id", |req: &mut Request<'_>| -> Result<(), HttpError> {
//!         let known = req.param("id") == Some("42");
//!         req.send_text(if known { "hello 42" } else { "who?" })
//!     })
//!     .unwrap();
//!
//! let found = router.lookup(Method::GET, "/users/42", false).unwrap();
//! assert_eq!(found.params().get("id", "/users/42"), Some("42"));
//! assert!(router.lookup(Method::GET, "/users", false).is_none());
//! ```

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;

use crate::ascii::eq_ignore_case;
use crate::config::{MAX_ROUTE_MIDDLEWARE, MAX_ROUTE_PARAMS, MAX_TOTAL_MIDDLEWARE};
use crate::connection::Method;
use crate::error::HttpError;
use crate::request::Request;
use crate::server::{WebSocket, WsEvent};

/// Handles an HTTP request.
pub trait Handler {
    /// Produce a response through `req`. Errors returned before anything was sent are turned
    /// into an error response.
    fn handle(&self, req: &mut Request<'_>) -> Result<(), HttpError>;
}

impl<F> Handler for F
where
    F: Fn(&mut Request<'_>) -> Result<(), HttpError>,
{
    fn handle(&self, req: &mut Request<'_>) -> Result<(), HttpError> {
        self(req)
    }
}

/// Runs before a handler. Call [`Next::run`] to continue down the chain, or return without
/// calling it to end the request.
pub trait Middleware {
    /// Process `req`.
    fn call(&self, req: &mut Request<'_>, next: Next<'_>) -> Result<(), HttpError>;
}

impl<F> Middleware for F
where
    F: Fn(&mut Request<'_>, Next<'_>) -> Result<(), HttpError>,
{
    fn call(&self, req: &mut Request<'_>, next: Next<'_>) -> Result<(), HttpError> {
        self(req, next)
    }
}

/// Turns a handler error into a response. Returning `Ok` marks the error as handled, otherwise
/// the next error handler (and finally the default mapping) is tried.
pub trait ErrorHandler {
    /// Handle `err` for `req`.
    fn handle(&self, err: &HttpError, req: &mut Request<'_>) -> Result<(), HttpError>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&HttpError, &mut Request<'_>) -> Result<(), HttpError>,
{
    fn handle(&self, err: &HttpError, req: &mut Request<'_>) -> Result<(), HttpError> {
        self(err, req)
    }
}

/// Receives the events of an upgraded connection.
pub trait WsHandler {
    /// Handle one event.
    fn on_event(&self, ws: &mut WebSocket<'_>, event: WsEvent<'_>);
}

impl<F> WsHandler for F
where
    F: Fn(&mut WebSocket<'_>, WsEvent<'_>),
{
    fn on_event(&self, ws: &mut WebSocket<'_>, event: WsEvent<'_>) {
        self(ws, event)
    }
}

/// The remainder of a middleware chain.
pub struct Next<'n> {
    chain: &'n [Rc<dyn Middleware>],
    handler: &'n dyn Handler,
}

impl<'n> Next<'n> {
    pub(crate) fn new(chain: &'n [Rc<dyn Middleware>], handler: &'n dyn Handler) -> Self {
        Next { chain, handler }
    }

    /// Invoke the next middleware, or the handler once the chain is exhausted.
    pub fn run(self, req: &mut Request<'_>) -> Result<(), HttpError> {
        match self.chain.split_first() {
            Some((mw, rest)) => mw.call(req, Next::new(rest, self.handler)),
            None => self.handler.handle(req),
        }
    }
}

/// Captured route parameters, stored as byte ranges of the matched path.
#[derive(Clone, Default)]
pub struct Params {
    entries: ArrayVec<(Rc<str>, u16, u16), MAX_ROUTE_PARAMS>,
}

impl Params {
    /// The value of `name` within `path`, the path the parameters were captured from.
    pub fn get<'p>(&self, name: &str, path: &'p str) -> Option<&'p str> {
        self.entries
            .iter()
            .find(|(n, _, _)| &**n == name)
            .and_then(|(_, start, end)| path.get(*start as usize..*end as usize))
    }

    /// Names and values in capture order.
    pub fn iter<'s, 'p: 's>(&'s self, path: &'p str) -> impl Iterator<Item = (&'s str, &'p str)> {
        self.entries.iter().map(move |(n, start, end)| {
            (&**n, path.get(*start as usize..*end as usize).unwrap_or(""))
        })
    }

    /// Number of captured parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move every range `by` bytes to the right, for parameters captured from a path whose
    /// mount prefix was stripped.
    pub(crate) fn shift(&mut self, by: u16) {
        for (_, start, end) in self.entries.iter_mut() {
            *start += by;
            *end += by;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// What a lookup matched.
#[derive(Clone)]
pub enum Target {
    /// An HTTP handler.
    Http(Rc<dyn Handler>),
    /// A WebSocket handler.
    Ws(Rc<dyn WsHandler>),
}

/// A successful lookup.
#[derive(Clone)]
pub struct Match {
    pub(crate) target: Target,
    pub(crate) route_id: u16,
    pub(crate) params: Params,
    pub(crate) middleware: ArrayVec<Rc<dyn Middleware>, MAX_TOTAL_MIDDLEWARE>,
}

impl Match {
    /// Identifier of the matched route, unique within its router.
    pub fn route_id(&self) -> u16 {
        self.route_id
    }

    /// Captured parameters.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Route middleware collected along the matched path.
    pub fn middleware_count(&self) -> usize {
        self.middleware.len()
    }

    /// Whether the match is a WebSocket route.
    pub fn is_websocket(&self) -> bool {
        matches!(self.target, Target::Ws(_))
    }
}

struct RouteEntry {
    method: Method,
    handler: Rc<dyn Handler>,
    id: u16,
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Static,
    Param { optional: bool },
    Wildcard,
}

struct Node {
    label: Rc<str>,
    kind: Kind,
    children: Vec<Node>,
    param: Option<Box<Node>>,
    wildcard: Option<Box<Node>>,
    routes: Vec<RouteEntry>,
    ws: Option<(Rc<dyn WsHandler>, u16)>,
    middleware: Vec<Rc<dyn Middleware>>,
}

impl Node {
    fn new(label: &str, kind: Kind) -> Self {
        Node {
            label: Rc::from(label),
            kind,
            children: Vec::new(),
            param: None,
            wildcard: None,
            routes: Vec::new(),
            ws: None,
            middleware: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.routes.is_empty()
            && self.ws.is_none()
            && self.children.is_empty()
            && self.param.is_none()
            && self.wildcard.is_none()
    }
}

enum Segment<'a> {
    Static(&'a str),
    Param(&'a str, bool),
    Wildcard(&'a str),
}

fn segments(pattern: &str, strict: bool) -> Result<Vec<Segment<'_>>, HttpError> {
    if !pattern.starts_with('/') {
        return Err(HttpError::InvalidArg);
    }

    let mut out = Vec::new();
    let mut parts = pattern.split('/').filter(|s| !s.is_empty()).peekable();
    while let Some(part) = parts.next() {
        let seg = if let Some(name) = part.strip_prefix(':') {
            let (name, optional) = match name.strip_suffix('?') {
                Some(name) => (name, true),
                None => (name, false),
            };
            if name.is_empty() {
                return Err(HttpError::InvalidArg);
            }
            Segment::Param(name, optional)
        } else if let Some(name) = part.strip_prefix('*') {
            if parts.peek().is_some() {
                return Err(HttpError::InvalidArg);
            }
            Segment::Wildcard(if name.is_empty() { "*" } else { name })
        } else {
            Segment::Static(part)
        };
        out.push(seg);
    }

    if strict && pattern.len() > 1 && pattern.ends_with('/') {
        if matches!(out.last(), Some(Segment::Wildcard(_))) {
            return Err(HttpError::InvalidArg);
        }
        out.push(Segment::Static(""));
    }

    Ok(out)
}

/// A tree of routes. A [`Server`](crate::server::Server) owns one root router and any number
/// of routers mounted under a prefix.
pub struct Router {
    root: Node,
    middleware: Vec<Rc<dyn Middleware>>,
    error_handler: Option<Rc<dyn ErrorHandler>>,
    case_sensitive: bool,
    strict: bool,
    next_id: u16,
}

impl Router {
    /// An empty, case sensitive, non strict router.
    pub fn new() -> Self {
        Router {
            root: Node::new("", Kind::Static),
            middleware: Vec::new(),
            error_handler: None,
            case_sensitive: true,
            strict: false,
            next_id: 1,
        }
    }

    /// Match literal segments case sensitively (the default) or not. Set before adding routes.
    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    /// In strict mode `/a/` and `/a` are different routes. By default a trailing slash is
    /// ignored. Set before adding routes.
    pub fn strict(mut self, yes: bool) -> Self {
        self.strict = yes;
        self
    }

    /// Register `handler` for `method` requests to `pattern`.
    pub fn route<H: Handler + 'static>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
    ) -> Result<&mut Self, HttpError> {
        self.route_with(method, pattern, handler, &[])
    }

    /// Register `handler` with up to four middleware that run only for this route.
    pub fn route_with<H: Handler + 'static>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
        middleware: &[Rc<dyn Middleware>],
    ) -> Result<&mut Self, HttpError> {
        if middleware.len() > MAX_ROUTE_MIDDLEWARE {
            return Err(HttpError::InvalidArg);
        }

        let id = self.next_id;
        let node = self.insert(pattern)?;
        node.routes.push(RouteEntry {
            method,
            handler: Rc::new(handler),
            id,
        });
        node.middleware.extend(middleware.iter().cloned());
        self.next_id = self.next_id.wrapping_add(1);

        debug!("route {} added", id);
        Ok(self)
    }

    /// Register a `GET` handler.
    pub fn get<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::GET, pattern, h)
    }

    /// Register a `POST` handler.
    pub fn post<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::POST, pattern, h)
    }

    /// Register a `PUT` handler.
    pub fn put<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::PUT, pattern, h)
    }

    /// Register a `DELETE` handler.
    pub fn delete<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::DELETE, pattern, h)
    }

    /// Register a `PATCH` handler.
    pub fn patch<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::PATCH, pattern, h)
    }

    /// Register a handler for every method.
    pub fn any<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::Any, pattern, h)
    }

    /// Register a WebSocket handler. Replaces an existing one on the same pattern.
    pub fn websocket<W: WsHandler + 'static>(
        &mut self,
        pattern: &str,
        handler: W,
    ) -> Result<&mut Self, HttpError> {
        let id = self.next_id;
        let node = self.insert(pattern)?;
        node.ws = Some((Rc::new(handler), id));
        self.next_id = self.next_id.wrapping_add(1);
        Ok(self)
    }

    /// Add middleware that runs for every route of this router.
    pub fn middleware<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.middleware.push(Rc::new(middleware));
        self
    }

    /// Set the error handler consulted for errors from this router's routes.
    pub fn on_error<E: ErrorHandler + 'static>(&mut self, handler: E) -> &mut Self {
        self.error_handler = Some(Rc::new(handler));
        self
    }

    pub(crate) fn router_middleware(&self) -> &[Rc<dyn Middleware>] {
        &self.middleware
    }

    pub(crate) fn error_handler(&self) -> Option<Rc<dyn ErrorHandler>> {
        self.error_handler.clone()
    }

    /// Remove the `method` handlers registered on exactly `pattern`. Returns whether any were.
    pub fn remove(&mut self, method: Method, pattern: &str) -> bool {
        let Ok(segs) = segments(pattern, self.strict) else {
            return false;
        };
        let case_sensitive = self.case_sensitive;

        let mut node = &mut self.root;
        for seg in segs.iter() {
            let next = match seg {
                Segment::Static(label) => node
                    .children
                    .iter_mut()
                    .find(|c| label_eq(case_sensitive, &c.label, label)),
                Segment::Param(name, _) => node
                    .param
                    .as_deref_mut()
                    .filter(|p| &*p.label == *name),
                Segment::Wildcard(_) => node.wildcard.as_deref_mut(),
            };
            match next {
                Some(next) => node = next,
                None => return false,
            }
        }

        let before = node.routes.len();
        node.routes.retain(|r| r.method != method);
        before != node.routes.len()
    }

    fn insert(&mut self, pattern: &str) -> Result<&mut Node, HttpError> {
        let segs = segments(pattern, self.strict)?;
        let case_sensitive = self.case_sensitive;

        let mut node = &mut self.root;
        for seg in segs {
            node = match seg {
                Segment::Static(label) => {
                    let pos = node
                        .children
                        .iter()
                        .position(|c| label_eq(case_sensitive, &c.label, label));
                    match pos {
                        Some(i) => &mut node.children[i],
                        None => {
                            let at = node
                                .children
                                .binary_search_by(|c| (*c.label).cmp(label))
                                .unwrap_or_else(|i| i);
                            node.children.insert(at, Node::new(label, Kind::Static));
                            &mut node.children[at]
                        }
                    }
                }
                Segment::Param(name, optional) => {
                    let param = node
                        .param
                        .get_or_insert_with(|| Box::new(Node::new(name, Kind::Param { optional })));
                    if &*param.label != name {
                        return Err(HttpError::InvalidArg);
                    }
                    if optional {
                        param.kind = Kind::Param { optional };
                    }
                    &mut **param
                }
                Segment::Wildcard(name) => {
                    let wildcard = node
                        .wildcard
                        .get_or_insert_with(|| Box::new(Node::new(name, Kind::Wildcard)));
                    if &*wildcard.label != name {
                        return Err(HttpError::InvalidArg);
                    }
                    &mut **wildcard
                }
            };
        }

        Ok(node)
    }

    /// Find the handler for `method` and `path` (the request target without its query string).
    /// With `websocket` only WebSocket routes are considered.
    pub fn lookup(&self, method: Method, path: &str, websocket: bool) -> Option<Match> {
        let query = Query {
            method,
            path,
            websocket,
        };
        let mut params = ArrayVec::new();
        let mut trail: ArrayVec<&Node, 64> = ArrayVec::new();

        let (target, route_id) = self.walk(&self.root, &query, 0, &mut params, &mut trail)?;

        let mut middleware = ArrayVec::new();
        let root = [&self.root];
        let nodes: &[&Node] = if trail.is_empty() { &root } else { &trail };
        for mw in nodes.iter().flat_map(|n| n.middleware.iter()) {
            if middleware.try_push(mw.clone()).is_err() {
                warn!("route middleware limit reached");
                break;
            }
        }

        Some(Match {
            target,
            route_id,
            params: Params { entries: params },
            middleware,
        })
    }

    fn walk<'r>(
        &'r self,
        node: &'r Node,
        q: &Query<'_>,
        pos: usize,
        params: &mut ArrayVec<(Rc<str>, u16, u16), MAX_ROUTE_PARAMS>,
        trail: &mut ArrayVec<&'r Node, 64>,
    ) -> Option<(Target, u16)> {
        let path = q.path;
        let bytes = path.as_bytes();
        let mut start = pos;
        while start < bytes.len() && bytes[start] == b'/' {
            start += 1;
        }

        if start == bytes.len() {
            return self.exhausted(node, q, trail);
        }

        let end = path[start..].find('/').map_or(path.len(), |i| start + i);
        let seg = &path[start..end];

        for child in node.children.iter() {
            if child.kind == Kind::Static
                && !child.label.is_empty()
                && label_eq(self.case_sensitive, &child.label, seg)
            {
                if trail.try_push(child).is_err() {
                    return None;
                }
                if let Some(found) = self.walk(child, q, end, params, trail) {
                    return Some(found);
                }
                trail.pop();
            }
        }

        if let Some(param) = node.param.as_deref() {
            if params
                .try_push((param.label.clone(), start as u16, end as u16))
                .is_ok()
            {
                if trail.try_push(param).is_err() {
                    return None;
                }
                if let Some(found) = self.walk(param, q, end, params, trail) {
                    return Some(found);
                }
                trail.pop();
                params.pop();
            }
        }

        if let Some(wildcard) = node.wildcard.as_deref() {
            let rest_end = if self.strict {
                path.len()
            } else {
                path.trim_end_matches('/').len()
            };
            if rest_end > start
                && params
                    .try_push((wildcard.label.clone(), start as u16, rest_end as u16))
                    .is_ok()
            {
                if trail.try_push(wildcard).is_err() {
                    return None;
                }
                if let Some(found) = self.terminal(wildcard, q) {
                    return Some(found);
                }
                trail.pop();
                params.pop();
            }
        }

        None
    }

    fn exhausted<'r>(
        &'r self,
        node: &'r Node,
        q: &Query<'_>,
        trail: &mut ArrayVec<&'r Node, 64>,
    ) -> Option<(Target, u16)> {
        if self.strict && q.path.len() > 1 && q.path.ends_with('/') {
            let slash = node.children.iter().find(|c| c.label.is_empty())?;
            trail.try_push(slash).ok()?;
            let found = self.terminal(slash, q);
            if found.is_none() {
                trail.pop();
            }
            return found;
        }

        if let Some(found) = self.terminal(node, q) {
            return Some(found);
        }

        let param = node.param.as_deref()?;
        if param.kind != (Kind::Param { optional: true }) {
            return None;
        }
        trail.try_push(param).ok()?;
        let found = self.terminal(param, q);
        if found.is_none() {
            trail.pop();
        }
        found
    }

    fn terminal(&self, node: &Node, q: &Query<'_>) -> Option<(Target, u16)> {
        if q.websocket {
            return node
                .ws
                .as_ref()
                .map(|(h, id)| (Target::Ws(h.clone()), *id));
        }

        node.routes
            .iter()
            .find(|r| r.method == q.method)
            .or_else(|| node.routes.iter().find(|r| r.method == Method::Any))
            .map(|r| (Target::Http(r.handler.clone()), r.id))
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

struct Query<'q> {
    method: Method,
    path: &'q str,
    websocket: bool,
}

fn label_eq(case_sensitive: bool, label: &str, seg: &str) -> bool {
    if case_sensitive {
        label == seg
    } else {
        eq_ignore_case(label.as_bytes(), seg.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    fn ok(_: &mut Request<'_>) -> Result<(), HttpError> {
        Ok(())
    }

    fn pass(req: &mut Request<'_>, next: Next<'_>) -> Result<(), HttpError> {
        next.run(req)
    }

    fn id(router: &Router, method: Method, path: &str) -> Option<u16> {
        router.lookup(method, path, false).map(|m| m.route_id())
    }

    #[test]
    fn test_static_routes() {
        let mut router = Router::new();
        router.get("/", ok).unwrap(); // 1
        router.get("/about", ok).unwrap(); // 2
        router.get("/api/status", ok).unwrap(); // 3

        assert_eq!(id(&router, Method::GET, "/"), Some(1));
        assert_eq!(id(&router, Method::GET, "/about"), Some(2));
        assert_eq!(id(&router, Method::GET, "/about/"), Some(2));
        assert_eq!(id(&router, Method::GET, "/api/status"), Some(3));
        assert_eq!(id(&router, Method::GET, "/api"), None);
        assert_eq!(id(&router, Method::GET, "/About"), None);
    }

    #[test]
    fn test_params() {
        let mut router = Router::new();
        router.get("/users/:id", ok).unwrap();
        router.get("/users/:id/posts/:post", ok).unwrap();

        let path = "/users/42/posts/7";
        let found = router.lookup(Method::GET, path, false).unwrap();
        assert_eq!(found.route_id(), 2);
        assert_eq!(found.params().get("id", path), Some("42"));
        assert_eq!(found.params().get("post", path), Some("7"));
        assert_eq!(found.params().len(), 2);

        let found = router.lookup(Method::GET, "/users/abc", false).unwrap();
        assert_eq!(found.params().get("id", "/users/abc"), Some("abc"));
        assert_eq!(found.params().get("post", "/users/abc"), None);
    }

    #[test]
    fn test_priority_and_backtracking() {
        let mut router = Router::new();
        router.get("/files/new", ok).unwrap(); // 1
        router.get("/files/:id", ok).unwrap(); // 2
        router.get("/files/*", ok).unwrap(); // 3
        router.get("/files/:id/meta", ok).unwrap(); // 4

        assert_eq!(id(&router, Method::GET, "/files/new"), Some(1));
        assert_eq!(id(&router, Method::GET, "/files/17"), Some(2));
        assert_eq!(id(&router, Method::GET, "/files/17/meta"), Some(4));
        // the param branch dead ends, the wildcard picks it up
        assert_eq!(id(&router, Method::GET, "/files/a/b/c"), Some(3));

        let found = router.lookup(Method::GET, "/files/a/b/c", false).unwrap();
        assert_eq!(found.params().get("*", "/files/a/b/c"), Some("a/b/c"));
    }

    #[test]
    fn test_wildcard_needs_a_segment() {
        let mut router = Router::new();
        router.get("/*", ok).unwrap();
        router.get("/static/*path", ok).unwrap();

        assert_eq!(id(&router, Method::GET, "/"), None);
        assert_eq!(id(&router, Method::GET, "/anything/here"), Some(1));
        assert_eq!(id(&router, Method::GET, "/static"), Some(1));

        let found = router.lookup(Method::GET, "/static/css/a.css", false).unwrap();
        assert_eq!(
            found.params().get("path", "/static/css/a.css"),
            Some("css/a.css")
        );
    }

    #[test]
    fn test_optional_param() {
        let mut router = Router::new();
        router.get("/posts/:page?", ok).unwrap();

        let found = router.lookup(Method::GET, "/posts", false).unwrap();
        assert!(found.params().is_empty());
        let found = router.lookup(Method::GET, "/posts/3", false).unwrap();
        assert_eq!(found.params().get("page", "/posts/3"), Some("3"));
    }

    #[test]
    fn test_method_selection() {
        let mut router = Router::new();
        router.any("/thing", ok).unwrap(); // 1
        router.get("/thing", ok).unwrap(); // 2
        router.get("/thing", ok).unwrap(); // 3, shadowed

        assert_eq!(id(&router, Method::GET, "/thing"), Some(2));
        assert_eq!(id(&router, Method::DELETE, "/thing"), Some(1));

        assert!(router.remove(Method::GET, "/thing"));
        assert_eq!(id(&router, Method::GET, "/thing"), Some(1));
        assert!(!router.remove(Method::POST, "/thing"));
        assert!(!router.remove(Method::GET, "/nowhere"));
    }

    #[test]
    fn test_method_mismatch_is_not_found() {
        let mut router = Router::new();
        router.post("/submit", ok).unwrap();
        assert_eq!(id(&router, Method::GET, "/submit"), None);
    }

    #[test]
    fn test_case_insensitive() {
        let mut router = Router::new().case_sensitive(false);
        router.get("/Api/Status", ok).unwrap();
        assert_eq!(id(&router, Method::GET, "/api/status"), Some(1));
        assert_eq!(id(&router, Method::GET, "/API/STATUS"), Some(1));
    }

    #[test]
    fn test_strict_trailing_slash() {
        let mut router = Router::new().strict(true);
        router.get("/dir/", ok).unwrap(); // 1
        router.get("/file", ok).unwrap(); // 2

        assert_eq!(id(&router, Method::GET, "/dir/"), Some(1));
        assert_eq!(id(&router, Method::GET, "/dir"), None);
        assert_eq!(id(&router, Method::GET, "/file"), Some(2));
        assert_eq!(id(&router, Method::GET, "/file/"), None);
    }

    #[test]
    fn test_websocket_routes_are_separate() {
        let mut router = Router::new();
        router.get("/live", ok).unwrap(); // 1
        router
            .websocket("/live", |_: &mut WebSocket<'_>, _: WsEvent<'_>| {})
            .unwrap(); // 2

        let http = router.lookup(Method::GET, "/live", false).unwrap();
        assert!(!http.is_websocket());
        assert_eq!(http.route_id(), 1);

        let ws = router.lookup(Method::GET, "/live", true).unwrap();
        assert!(ws.is_websocket());
        assert_eq!(ws.route_id(), 2);

        assert!(router.lookup(Method::GET, "/other", true).is_none());
    }

    #[test]
    fn test_route_middleware_collected() {
        let mw: Rc<dyn Middleware> = Rc::new(pass);
        let mut router = Router::new();
        router
            .route_with(Method::GET, "/admin", ok, &[mw.clone()])
            .unwrap();
        router
            .route_with(Method::GET, "/admin/users", ok, &[mw.clone(), mw.clone()])
            .unwrap();
        router.get("/public", ok).unwrap();

        let found = router.lookup(Method::GET, "/admin/users", false).unwrap();
        assert_eq!(found.middleware_count(), 3);
        let found = router.lookup(Method::GET, "/admin", false).unwrap();
        assert_eq!(found.middleware_count(), 1);
        let found = router.lookup(Method::GET, "/public", false).unwrap();
        assert_eq!(found.middleware_count(), 0);

        let too_many = [mw.clone(), mw.clone(), mw.clone(), mw.clone(), mw];
        assert_eq!(
            router
                .route_with(Method::GET, "/x", ok, &too_many)
                .err(),
            Some(HttpError::InvalidArg)
        );
    }

    #[test]
    fn test_invalid_patterns() {
        let mut router = Router::new();
        assert_eq!(router.get("no-slash", ok).err(), Some(HttpError::InvalidArg));
        assert_eq!(router.get("/a/*/b", ok).err(), Some(HttpError::InvalidArg));
        assert_eq!(router.get("/a/:", ok).err(), Some(HttpError::InvalidArg));

        router.get("/u/:id", ok).unwrap();
        assert_eq!(router.get("/u/:name/x", ok).err(), Some(HttpError::InvalidArg));
        assert!(!router.is_empty());
    }
}
