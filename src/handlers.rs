//! Demo route handlers.
//!
//! - `/demo/tile`: a fixed 40x40 PNG
//! - `/demo/tiles`: a page referencing the tile 200 times
//! - `/demo/echo`: the request body, returned verbatim
//! - `/demo/upload`: MD5 of an uploaded file, or the upload form
//! - `/<n>`: `n` bytes of synthetic payload
//! - `/...`: static files, when a content root is configured

use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::{debug, warn};

use crate::body::{self, Body};
use crate::error::ClientInputError;
use crate::payload::parse_size;
use crate::router::Handler;
use crate::upload::{ContentDigest, UploadError, UploadHasher};

/// Name of the multipart field carrying the upload.
pub const UPLOAD_FIELD: &str = "uploadfile";

/// Number of tile references on the tiles page.
pub const TILE_COUNT: usize = 200;

const HTML: &str = "text/html; charset=utf-8";
const OCTET_STREAM: &str = "application/octet-stream";

/// Characters escaped in directory listing links.
const HREF: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

const TILE_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x28, 0x01, 0x03, 0x00, 0x00, 0x00, 0xb6, 0x30, 0x2a,
    0x2e, 0x00, 0x00, 0x00, 0x03, 0x50, 0x4c, 0x54, 0x45, 0x5a, 0xc3, 0x5a, 0xad, 0x38, 0xaa, 0xdb,
    0x00, 0x00, 0x00, 0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0x01, 0x63, 0x18, 0x61, 0x00, 0x00, 0x00,
    0xf0, 0x00, 0x01, 0xe2, 0xb8, 0x75, 0x22, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

const UPLOAD_FORM: &str = r#"<html><body><form action="/demo/upload" method="post" enctype="multipart/form-data">
                <input type="file" name="uploadfile"><br>
                <input type="submit">
            </form></body></html>"#;

/// Serves the fixed tile image.
pub struct Tile;

#[async_trait]
impl Handler for Tile {
    async fn handle(&self, _request: Request<Body>) -> Response<Body> {
        body::ok(TILE_PNG, sniff_content_type(TILE_PNG))
    }
}

/// Serves a page of cache-busted tile references.
pub struct Tiles;

impl Tiles {
    fn page() -> String {
        let mut page = String::with_capacity(64 + TILE_COUNT * 40);
        page.push_str("<html><head><style>img{width:40px;height:40px;}</style></head><body>");
        for i in 0..TILE_COUNT {
            let _ = write!(page, r#"<img src="/demo/tile?cachebust={i}">"#);
        }
        page.push_str("</body></html>");
        page
    }
}

#[async_trait]
impl Handler for Tiles {
    async fn handle(&self, _request: Request<Body>) -> Response<Body> {
        body::ok(Self::page(), HTML)
    }
}

/// Returns the request body unchanged.
pub struct EchoBody;

#[async_trait]
impl Handler for EchoBody {
    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let (parts, incoming) = request.into_parts();
        let data = match incoming.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "Error reading body while handling /demo/echo");
                Bytes::new()
            }
        };
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(OCTET_STREAM));
        let len = data.len() as u64;
        body::respond(StatusCode::OK, content_type, len, body::full(data))
    }
}

/// Hashes multipart uploads.
pub struct Upload {
    hasher: UploadHasher,
}

impl Upload {
    pub fn new(hasher: UploadHasher) -> Self {
        Self { hasher }
    }

    async fn receive(&self, request: Request<Body>) -> Result<ContentDigest, UploadError> {
        let boundary = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|ct| multer::parse_boundary(ct).ok())
            .ok_or(ClientInputError::MissingBoundary)?;
        self.hasher
            .hash_multipart(request.into_body().into_data_stream(), boundary, UPLOAD_FIELD)
            .await
    }
}

#[async_trait]
impl Handler for Upload {
    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        if *request.method() == Method::POST || *request.method() == Method::PUT {
            match self.receive(request).await {
                Ok(digest) => {
                    debug!(digest = %digest, "Upload hashed");
                    return body::ok(digest.to_hex(), "text/plain; charset=utf-8");
                }
                Err(e) => warn!(error = %e, "Error receiving upload"),
            }
        }
        body::ok(UPLOAD_FORM, HTML)
    }
}

/// Streams `n` synthetic bytes for a path of `/<n>`.
pub struct PayloadHandler;

#[async_trait]
impl Handler for PayloadHandler {
    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let path = request.uri().path();
        let raw = path.strip_prefix('/').unwrap_or(path);
        match parse_size(raw) {
            Some(n) => body::respond(
                StatusCode::OK,
                HeaderValue::from_static(OCTET_STREAM),
                n,
                body::payload(n),
            ),
            None => {
                debug!(error = %ClientInputError::InvalidSize(raw.to_string()), "Rejecting payload request");
                body::status(StatusCode::BAD_REQUEST)
            }
        }
    }
}

/// Serves files below a root directory.
///
/// A directory is answered with its `index.html` if it has one, and with a
/// listing otherwise. Directory paths without a trailing slash redirect to
/// the slashed form so relative links resolve.
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Map a request path onto the root, refusing anything that escapes it.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(request_path).decode_utf8().ok()?;
        let mut path = self.root.clone();
        for component in Path::new(decoded.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }

    async fn serve_file(path: &Path, len: u64) -> Response<Body> {
        match tokio::fs::File::open(path).await {
            Ok(file) => body::respond(
                StatusCode::OK,
                HeaderValue::from_static(content_type_for(path)),
                len,
                body::file(file),
            ),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Cannot open file");
                body::status(StatusCode::NOT_FOUND)
            }
        }
    }

    async fn listing(dir: &Path) -> Response<Body> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "Cannot list directory");
                return body::status(StatusCode::NOT_FOUND);
            }
        };

        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        let mut page = String::from("<pre>\n");
        for name in &names {
            let _ = writeln!(
                page,
                r#"<a href="{}">{}</a>"#,
                utf8_percent_encode(name, HREF),
                escape_html(name)
            );
        }
        page.push_str("</pre>\n");
        body::ok(page, HTML)
    }
}

#[async_trait]
impl Handler for StaticFiles {
    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let request_path = request.uri().path();
        let Some(path) = self.resolve(request_path) else {
            return body::status(StatusCode::NOT_FOUND);
        };

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => {
                debug!(path = %path.display(), "Static file not found");
                return body::status(StatusCode::NOT_FOUND);
            }
        };

        if meta.is_dir() {
            if !request_path.ends_with('/') {
                return match HeaderValue::try_from(format!("{request_path}/")) {
                    Ok(location) => {
                        let mut response = body::status(StatusCode::MOVED_PERMANENTLY);
                        response.headers_mut().insert(LOCATION, location);
                        response
                    }
                    Err(_) => body::status(StatusCode::NOT_FOUND),
                };
            }
            let index = path.join("index.html");
            return match tokio::fs::metadata(&index).await {
                Ok(meta) if meta.is_file() => Self::serve_file(&index, meta.len()).await,
                _ => Self::listing(&path).await,
            };
        }

        if !meta.is_file() {
            return body::status(StatusCode::NOT_FOUND);
        }
        Self::serve_file(&path, meta.len()).await
    }
}

/// Content type from leading magic bytes.
fn sniff_content_type(data: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"%PDF-", "application/pdf"),
        (b"<html", HTML),
        (b"<!DOCTYPE html", HTML),
    ];

    SIGNATURES
        .iter()
        .find(|(magic, _)| data.starts_with(magic))
        .map(|(_, ct)| *ct)
        .unwrap_or(OCTET_STREAM)
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => HTML,
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("wasm") => "application/wasm",
        _ => OCTET_STREAM,
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{generate, MAX_PAYLOAD_SIZE};
    use http::header::CONTENT_LENGTH;

    fn request(method: Method, path: &str, content_type: Option<&str>, data: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        builder.body(body::full(data)).unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        request(Method::GET, path, None, Vec::new())
    }

    async fn body_bytes(response: Response<Body>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn multipart_upload(data: &[u8]) -> Vec<u8> {
        let mut body =
            b"--abc\r\nContent-Disposition: form-data; name=\"uploadfile\"; filename=\"x\"\r\n\r\n"
                .to_vec();
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n--abc--\r\n");
        body
    }

    #[test]
    fn test_sniff() {
        assert_eq!(sniff_content_type(TILE_PNG), "image/png");
        assert_eq!(sniff_content_type(b"<html><body>"), HTML);
        assert_eq!(sniff_content_type(b"\x00\x01"), OCTET_STREAM);
    }

    #[tokio::test]
    async fn test_tile_is_png() {
        let response = Tile.handle(get("/demo/tile")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
        assert_eq!(body_bytes(response).await.as_ref(), TILE_PNG);
    }

    #[tokio::test]
    async fn test_tiles_page() {
        let response = Tiles.handle(get("/demo/tiles")).await;
        let page = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert_eq!(page.matches("<img ").count(), TILE_COUNT);
        assert!(page.contains(r#"src="/demo/tile?cachebust=0""#));
        assert!(page.contains(r#"src="/demo/tile?cachebust=199""#));
    }

    #[tokio::test]
    async fn test_echo_body() {
        let response = EchoBody
            .handle(request(Method::POST, "/demo/echo", Some("text/plain"), b"ping".to_vec()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(body_bytes(response).await.as_ref(), b"ping");
    }

    #[tokio::test]
    async fn test_payload_sizes() {
        for n in [1u64, 10, 4096, MAX_PAYLOAD_SIZE] {
            let response = PayloadHandler.handle(get(&format!("/{n}"))).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[CONTENT_LENGTH], n.to_string().as_str());
        }
        let response = PayloadHandler.handle(get("/4096?x=1")).await;
        assert_eq!(body_bytes(response).await.as_ref(), generate(4096).as_slice());
    }

    #[tokio::test]
    async fn test_payload_rejects() {
        let too_big = format!("/{}", MAX_PAYLOAD_SIZE + 1);
        for path in ["/0", "/-1", "/abc", "/", too_big.as_str(), "/10/00"] {
            let response = PayloadHandler.handle(get(path)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "path {path}");
            assert!(body_bytes(response).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_upload_form_on_get() {
        let response = Upload::new(UploadHasher::default())
            .handle(get("/demo/upload"))
            .await;
        let page = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(page.contains(r#"name="uploadfile""#));
    }

    #[tokio::test]
    async fn test_upload_digest() {
        let data = generate(10_000);
        let response = Upload::new(UploadHasher::default())
            .handle(request(
                Method::POST,
                "/demo/upload",
                Some("multipart/form-data; boundary=abc"),
                multipart_upload(&data),
            ))
            .await;
        assert_eq!(
            body_bytes(response).await.as_ref(),
            ContentDigest::of(&data).to_hex().as_bytes()
        );
    }

    #[tokio::test]
    async fn test_upload_failure_shows_form() {
        let response = Upload::new(UploadHasher::default())
            .handle(request(Method::POST, "/demo/upload", None, b"junk".to_vec()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_bytes(response).await.starts_with(b"<html>"));

        let response = Upload::new(UploadHasher::new(16))
            .handle(request(
                Method::POST,
                "/demo/upload",
                Some("multipart/form-data; boundary=abc"),
                multipart_upload(&generate(100)),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_bytes(response).await.starts_with(b"<html>"));
    }

    #[test]
    fn test_resolve_blocks_traversal() {
        let files = StaticFiles::new(PathBuf::from("/srv/www"));
        assert_eq!(
            files.resolve("/a/b.html"),
            Some(PathBuf::from("/srv/www/a/b.html"))
        );
        assert_eq!(
            files.resolve("/a%20b.txt"),
            Some(PathBuf::from("/srv/www/a b.txt"))
        );
        assert_eq!(files.resolve("/../etc/passwd"), None);
        assert_eq!(files.resolve("/a/%2e%2e/%2e%2e/x"), None);
    }

    #[tokio::test]
    async fn test_static_files() {
        let root = std::env::temp_dir().join(format!("quic-demo-www-{}", std::process::id()));
        tokio::fs::create_dir_all(root.join("sub")).await.unwrap();
        tokio::fs::create_dir_all(root.join("bare/inner")).await.unwrap();
        tokio::fs::write(root.join("hello.txt"), b"hi").await.unwrap();
        tokio::fs::write(root.join("sub/index.html"), b"<html></html>").await.unwrap();
        tokio::fs::write(root.join("bare/a <b>.txt"), b"x").await.unwrap();

        let files = StaticFiles::new(root.clone());

        let response = files.handle(get("/hello.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(body_bytes(response).await.as_ref(), b"hi");

        let response = files.handle(get("/sub/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], HTML);
        assert_eq!(body_bytes(response).await.as_ref(), b"<html></html>");

        let response = files.handle(get("/bare")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "/bare/");

        let response = files.handle(get("/bare/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert_eq!(
            page,
            "<pre>\n<a href=\"a%20%3Cb%3E.txt\">a &lt;b&gt;.txt</a>\n<a href=\"inner/\">inner/</a>\n</pre>\n"
        );

        let response = files.handle(get("/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
