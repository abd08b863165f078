//! Message bodies shared by handlers, the server and the client.
//!
//! Requests and responses both carry a boxed [`Body`]. Small responses are a
//! single buffer; payloads and files are streamed in chunks.

use bytes::Bytes;
use futures::{stream, TryStreamExt};
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio_util::io::ReaderStream;

use crate::payload::PayloadChunks;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both sides of a request.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

/// A body holding `data`.
pub fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> Body {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// `len` bytes of synthetic payload, generated chunk by chunk.
pub fn payload(len: u64) -> Body {
    let chunks = PayloadChunks::new(len).map(|chunk| Ok(Frame::data(Bytes::from(chunk))));
    StreamBody::new(stream::iter(chunks)).boxed_unsync()
}

/// The contents of an open file.
pub fn file(file: tokio::fs::File) -> Body {
    let frames = ReaderStream::new(file)
        .map_ok(Frame::data)
        .map_err(BoxError::from);
    StreamBody::new(frames).boxed_unsync()
}

/// A response with an explicit content type and length.
pub fn respond(status: StatusCode, content_type: HeaderValue, len: u64, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(len));
    response
}

/// `200` with `data` as the whole body.
pub fn ok(data: impl Into<Bytes>, content_type: &'static str) -> Response<Body> {
    let data = data.into();
    let len = data.len() as u64;
    respond(StatusCode::OK, HeaderValue::from_static(content_type), len, full(data))
}

/// A bodiless response.
pub fn status(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}
