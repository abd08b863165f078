//! Upload hashing.
//!
//! Uploads are hashed incrementally: bytes go into the MD5 state as they
//! arrive and are dropped right after, so memory use is bounded by the read
//! buffer rather than by the size of the upload. A ceiling is enforced while
//! reading, so the size does not have to be known up front.
//!
//! Multipart bodies are split by `multer`; the chosen field is streamed into
//! the same hashing path.

use std::fmt;
use std::io;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use crate::body::BoxError;
use crate::error::ClientInputError;

/// Largest upload accepted by default (1 GiB).
pub const MAX_UPLOAD_SIZE: u64 = 1 << 30;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 128-bit content digest of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 16]);

impl ContentDigest {
    /// Digest of an in-memory byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        let mut sink = HashSink::new(u64::MAX);
        // cannot exceed u64::MAX
        let _ = sink.update(bytes);
        sink.finish()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Errors raised while hashing an upload.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Input(#[from] ClientInputError),
    #[error("upload read failed: {0}")]
    Io(#[from] io::Error),
    #[error("multipart body: {0}")]
    Multipart(#[from] multer::Error),
}

/// Running MD5 state with a size ceiling.
pub struct HashSink {
    hasher: Md5,
    total: u64,
    limit: u64,
}

impl HashSink {
    pub fn new(limit: u64) -> Self {
        Self {
            hasher: Md5::new(),
            total: 0,
            limit,
        }
    }

    /// Feed a chunk, rejecting it once the running total passes the limit.
    pub fn update(&mut self, chunk: &[u8]) -> Result<(), ClientInputError> {
        let total = self.total.saturating_add(chunk.len() as u64);
        if total > self.limit {
            return Err(ClientInputError::TooLarge { limit: self.limit });
        }
        self.hasher.update(chunk);
        self.total = total;
        Ok(())
    }

    /// Bytes hashed so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn finish(self) -> ContentDigest {
        let mut out = [0u8; 16];
        out.copy_from_slice(&self.hasher.finalize());
        ContentDigest(out)
    }
}

/// Hashes upload streams under a fixed ceiling.
#[derive(Debug, Clone, Copy)]
pub struct UploadHasher {
    limit: u64,
}

impl UploadHasher {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// A fresh running digest bounded by this hasher's ceiling.
    pub fn sink(&self) -> HashSink {
        HashSink::new(self.limit)
    }

    /// Hash an upload stream.
    ///
    /// With a declared size, exactly that many bytes are read and a shorter
    /// stream is an error. Without one, the stream is read to its end and
    /// rejected as soon as it passes the ceiling.
    pub async fn hash<R>(
        &self,
        mut stream: R,
        declared_size: Option<u64>,
    ) -> Result<ContentDigest, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let limit = match declared_size {
            Some(size) if size > self.limit => {
                return Err(ClientInputError::TooLarge { limit: self.limit }.into());
            }
            Some(size) => size,
            None => self.limit,
        };

        let mut sink = HashSink::new(limit);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let want = match declared_size {
                Some(size) => (size - sink.total()).min(buf.len() as u64) as usize,
                None => buf.len(),
            };
            if want == 0 {
                break;
            }
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            sink.update(&buf[..n])?;
        }

        if let Some(expected) = declared_size {
            if sink.total() != expected {
                return Err(ClientInputError::Truncated {
                    expected,
                    actual: sink.total(),
                }
                .into());
            }
        }

        Ok(sink.finish())
    }

    /// Hash the content of `field` in a `multipart/form-data` body.
    ///
    /// Parts before it are skipped; parts after it are never read.
    pub async fn hash_multipart<S, O, E>(
        &self,
        body: S,
        boundary: String,
        field: &str,
    ) -> Result<ContentDigest, UploadError>
    where
        S: Stream<Item = Result<O, E>> + Send + 'static,
        O: Into<Bytes> + 'static,
        E: Into<BoxError> + 'static,
    {
        let mut multipart = multer::Multipart::new(body, boundary);
        while let Some(part) = multipart.next_field().await? {
            if part.name() == Some(field) {
                let reader = StreamReader::new(part.map_err(io::Error::other));
                return self.hash(Box::pin(reader), None).await;
            }
        }
        Err(ClientInputError::MissingField(field.to_string()).into())
    }
}

impl Default for UploadHasher {
    fn default() -> Self {
        Self::new(MAX_UPLOAD_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::generate;

    #[test]
    fn test_reference_digests() {
        assert_eq!(
            ContentDigest::of(b"").to_hex(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            ContentDigest::of(b"The quick brown fox jumps over the lazy dog").to_hex(),
            "9e107d9d372bb6826bd81d3542a419d6"
        );
    }

    #[tokio::test]
    async fn test_hash_matches_reference() {
        let data = generate(200_000);
        let hasher = UploadHasher::default();

        let digest = hasher
            .hash(&data[..], Some(data.len() as u64))
            .await
            .unwrap();
        assert_eq!(digest, ContentDigest::of(&data));

        let again = hasher.hash(&data[..], None).await.unwrap();
        assert_eq!(digest, again);
    }

    #[tokio::test]
    async fn test_declared_size_stops_reading() {
        let data = b"hello world";
        let digest = UploadHasher::default()
            .hash(&data[..], Some(5))
            .await
            .unwrap();
        assert_eq!(digest, ContentDigest::of(b"hello"));
    }

    #[tokio::test]
    async fn test_truncated_upload() {
        let err = UploadHasher::default()
            .hash(&b"abc"[..], Some(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Input(ClientInputError::Truncated {
                expected: 10,
                actual: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_ceiling_without_declared_size() {
        let err = UploadHasher::new(8)
            .hash(&b"0123456789"[..], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Input(ClientInputError::TooLarge { limit: 8 })
        ));
    }

    #[tokio::test]
    async fn test_declared_size_over_ceiling() {
        let err = UploadHasher::new(8)
            .hash(&b"0123"[..], Some(9))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Input(ClientInputError::TooLarge { .. })
        ));
    }

    fn multipart_body(boundary: &str, parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, data) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"f\"\r\n\r\n")
                    .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    /// Split `body` into small chunks so boundaries straddle reads.
    fn chunked(body: Vec<u8>) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        let chunks: Vec<_> = body
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks)
    }

    #[tokio::test]
    async fn test_hash_named_field() {
        let data = generate(50_000);
        let body = multipart_body("xyz", &[("other", b"skip me"), ("uploadfile", &data)]);
        let digest = UploadHasher::default()
            .hash_multipart(chunked(body), "xyz".to_string(), "uploadfile")
            .await
            .unwrap();
        assert_eq!(digest, ContentDigest::of(&data));
    }

    #[tokio::test]
    async fn test_missing_field() {
        let body = multipart_body("xyz", &[("other", b"data")]);
        let err = UploadHasher::default()
            .hash_multipart(chunked(body), "xyz".to_string(), "uploadfile")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Input(ClientInputError::MissingField(ref f)) if f == "uploadfile"
        ));
    }

    #[tokio::test]
    async fn test_field_over_ceiling() {
        let body = multipart_body("xyz", &[("uploadfile", b"0123456789")]);
        let err = UploadHasher::new(4)
            .hash_multipart(chunked(body), "xyz".to_string(), "uploadfile")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Input(ClientInputError::TooLarge { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_unterminated_body() {
        let mut body = multipart_body("xyz", &[("uploadfile", b"data")]);
        body.truncate(body.len() - 20);
        let result = UploadHasher::default()
            .hash_multipart(chunked(body), "xyz".to_string(), "uploadfile")
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_sink_tracks_total() {
        let mut sink = HashSink::new(4);
        sink.update(b"ab").unwrap();
        sink.update(b"cd").unwrap();
        assert_eq!(sink.total(), 4);
        assert!(sink.update(b"e").is_err());
        assert_eq!(sink.finish(), ContentDigest::of(b"abcd"));
    }
}
