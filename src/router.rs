//! Request routing.
//!
//! Patterns follow the usual path-mux rules:
//! - a pattern ending in `/` matches that whole subtree
//! - any other pattern matches one path exactly
//! - exact matches beat subtree matches, and longer subtrees beat shorter ones

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use tracing::debug;

use crate::body::{self, Body};
use crate::error::ConfigError;
use crate::handlers::{EchoBody, PayloadHandler, StaticFiles, Tile, Tiles, Upload};
use crate::upload::UploadHasher;

/// Something that turns one request into one response.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request<Body>) -> Response<Body>;
}

/// Mapping from path pattern to handler.
#[derive(Default)]
pub struct RouteTable {
    exact: HashMap<String, Arc<dyn Handler>>,
    /// Subtree patterns, longest first.
    subtrees: Vec<(String, Arc<dyn Handler>)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `pattern`. Patterns must be unique.
    pub fn route<H>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, ConfigError>
    where
        H: Handler + 'static,
    {
        if !pattern.starts_with('/') {
            return Err(ConfigError::InvalidRoute(pattern.to_string()));
        }
        if self.exact.contains_key(pattern) || self.subtrees.iter().any(|(p, _)| p == pattern) {
            return Err(ConfigError::DuplicateRoute(pattern.to_string()));
        }

        let handler: Arc<dyn Handler> = Arc::new(handler);
        if pattern.ends_with('/') {
            self.subtrees.push((pattern.to_string(), handler));
            self.subtrees.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        } else {
            self.exact.insert(pattern.to_string(), handler);
        }
        Ok(self)
    }

    /// Find the handler for `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<&Arc<dyn Handler>> {
        self.exact.get(path).or_else(|| {
            self.subtrees
                .iter()
                .find(|(prefix, _)| path.starts_with(prefix.as_str()))
                .map(|(_, handler)| handler)
        })
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.exact.len() + self.subtrees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the matching handler, or answer 404.
    pub async fn dispatch(&self, request: Request<Body>) -> Response<Body> {
        match self.lookup(request.uri().path()) {
            Some(handler) => handler.handle(request).await,
            None => {
                debug!(path = %request.uri().path(), "No route");
                body::status(StatusCode::NOT_FOUND)
            }
        }
    }
}

/// Build the demo route table.
///
/// With a static root, `/` serves files from it; otherwise `/` serves
/// synthetic payloads sized by the path.
pub fn demo_routes(www: Option<PathBuf>) -> Result<RouteTable, ConfigError> {
    let mut routes = RouteTable::new();
    routes
        .route("/demo/tile", Tile)?
        .route("/demo/tiles", Tiles)?
        .route("/demo/echo", EchoBody)?
        .route("/demo/upload", Upload::new(UploadHasher::default()))?;

    match www {
        Some(root) => routes.route("/", StaticFiles::new(root))?,
        None => routes.route("/", PayloadHandler)?,
    };

    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    struct Fixed(u16);

    #[async_trait]
    impl Handler for Fixed {
        async fn handle(&self, _request: Request<Body>) -> Response<Body> {
            body::status(StatusCode::from_u16(self.0).unwrap())
        }
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(body::empty()).unwrap()
    }

    async fn status(routes: &RouteTable, path: &str) -> u16 {
        routes.dispatch(get(path)).await.status().as_u16()
    }

    #[tokio::test]
    async fn test_exact_beats_subtree() {
        let mut routes = RouteTable::new();
        routes
            .route("/", Fixed(201))
            .unwrap()
            .route("/demo/", Fixed(202))
            .unwrap()
            .route("/demo/tile", Fixed(203))
            .unwrap();

        assert_eq!(status(&routes, "/demo/tile").await, 203);
        assert_eq!(status(&routes, "/demo/tiles").await, 202);
        assert_eq!(status(&routes, "/demo/").await, 202);
        assert_eq!(status(&routes, "/demo").await, 201);
        assert_eq!(status(&routes, "/1024").await, 201);
    }

    #[tokio::test]
    async fn test_no_match_is_404() {
        let mut routes = RouteTable::new();
        routes.route("/only", Fixed(200)).unwrap();
        let response = routes.dispatch(get("/other")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_duplicate_pattern() {
        let mut routes = RouteTable::new();
        routes.route("/a", Fixed(200)).unwrap();
        assert!(matches!(
            routes.route("/a", Fixed(200)),
            Err(ConfigError::DuplicateRoute(_))
        ));
        assert!(matches!(
            routes.route("a", Fixed(200)),
            Err(ConfigError::InvalidRoute(_))
        ));
    }

    #[test]
    fn test_demo_routes() {
        let routes = demo_routes(None).unwrap();
        assert_eq!(routes.len(), 5);
        assert!(routes.lookup("/demo/upload").is_some());
        assert!(routes.lookup("/123").is_some());
    }

    #[tokio::test]
    async fn test_static_root_replaces_payloads() {
        let root = std::env::temp_dir().join(format!("quic-demo-routes-{}", std::process::id()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("page.html"), b"<html></html>").await.unwrap();

        let routes = demo_routes(Some(root.clone())).unwrap();
        assert_eq!(routes.len(), 5);
        assert_eq!(status(&routes, "/1024").await, 404);
        assert_eq!(status(&routes, "/page.html").await, 200);
        assert_eq!(status(&routes, "/demo/tile").await, 200);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
