use std::{collections::HashMap, future::Future, pin::Pin};

use tracing::trace;
use webnode_common::{HttpError, Method, Request};

use super::response::Response;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HttpError>> + Send + 'a>>;

/// Route handler. Handlers either fill the response and return, leaving the
/// send to the engine, or send it themselves and keep working afterwards.
pub type Handler<S> = for<'a> fn(&'a S, &'a Request, &'a mut Response) -> HandlerFuture<'a>;

pub enum Resolved<S> {
    Handler(Handler<S>),
    MethodNotAllowed,
    NotFound,
}

/// Exact-match route table: path, then method.
pub struct Router<S> {
    routes: HashMap<String, HashMap<Method, Handler<S>>>,
}

impl<S> Default for Router<S> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<S> Router<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; a later registration for the same pair wins.
    pub fn route(mut self, path: &str, method: Method, handler: Handler<S>) -> Self {
        trace!("adding route {method} {path}");
        self.routes
            .entry(path.to_string())
            .or_default()
            .insert(method, handler);
        self
    }

    pub fn resolve(&self, path: &str, method: Method) -> Resolved<S> {
        match self.routes.get(path) {
            None => Resolved::NotFound,
            Some(methods) => match methods.get(&method) {
                Some(handler) => Resolved::Handler(*handler),
                None => Resolved::MethodNotAllowed,
            },
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first<'a>(_: &'a u8, _: &'a Request, resp: &'a mut Response) -> HandlerFuture<'a> {
        Box::pin(async move { resp.append_body("first") })
    }

    fn second<'a>(_: &'a u8, _: &'a Request, resp: &'a mut Response) -> HandlerFuture<'a> {
        Box::pin(async move { resp.append_body("second") })
    }

    #[test]
    fn unknown_method_on_known_path_is_distinct_from_unknown_path() {
        let router = Router::<u8>::new().route("/set_config", Method::Post, first);
        assert!(matches!(
            router.resolve("/set_config", Method::Get),
            Resolved::MethodNotAllowed
        ));
        assert!(matches!(
            router.resolve("/nope", Method::Post),
            Resolved::NotFound
        ));
        assert!(matches!(
            router.resolve("/set_config", Method::Post),
            Resolved::Handler(_)
        ));
    }

    #[test]
    fn paths_are_matched_exactly() {
        let router = Router::<u8>::new().route("/wifi_mode", Method::Get, first);
        assert!(matches!(
            router.resolve("/wifi_mode/", Method::Get),
            Resolved::NotFound
        ));
        assert!(matches!(
            router.resolve("/WIFI_MODE", Method::Get),
            Resolved::NotFound
        ));
    }

    #[tokio::test]
    async fn later_registration_replaces_earlier() {
        let router = Router::<u8>::new()
            .route("/x", Method::Get, first)
            .route("/x", Method::Get, second);
        assert_eq!(router.paths().count(), 1);

        let Resolved::Handler(handler) = router.resolve("/x", Method::Get) else {
            panic!("route missing");
        };
        let (server, _client) = tokio::io::duplex(64);
        let mut resp = Response::new(Box::new(server));
        let request = Request::new(
            Method::Get,
            webnode_common::http::parse_target("/x").unwrap(),
            Default::default(),
            Default::default(),
        );
        handler(&0, &request, &mut resp).await.unwrap();
        assert_eq!(
            resp.body(),
            &super::super::response::Body::Text("second".to_string())
        );
    }
}
