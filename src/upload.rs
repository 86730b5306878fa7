use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024; // 20 MiB
/// Slack on top of the file limit for multipart framing.
pub const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

const PDF_SIGNATURE: &[u8] = b"%PDF-";
const FILE_FIELDS: [&str; 2] = ["pdf", "file"];
const FALLBACK_FILENAME: &str = "upload.pdf";
const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub upload_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub received_at: String,
}

/// Where accepted documents are written.
#[derive(Clone)]
pub struct UploadStore {
    dir: Arc<PathBuf>,
    max_bytes: usize,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: Arc::new(dir.into()),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub const fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(self.dir.as_ref()).await?;
        info!("Storing uploads in {}", self.dir.display());
        Ok(())
    }

    fn path_for(&self, upload_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{upload_id}.pdf"))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("PDF exceeds {limit} byte upload limit")]
struct UploadSizeExceeded {
    limit: usize,
}

struct SizeLimitedStream<S> {
    inner: S,
    max: usize,
    received: usize,
    limit_hit: bool,
}

impl<S> SizeLimitedStream<S> {
    const fn new(inner: S, max: usize) -> Self {
        Self {
            inner,
            max,
            received: 0,
            limit_hit: false,
        }
    }
}

impl<S> Stream for SizeLimitedStream<S>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin + Send,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.limit_hit {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.received += chunk.len();
                if self.received > self.max {
                    self.limit_hit = true;
                    let limit = self.max;
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        UploadSizeExceeded { limit },
                    ))));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Why a document was not stored.
#[derive(Debug, thiserror::Error)]
enum IngestError {
    #[error("upload too large")]
    TooLarge { limit: usize },
    #[error("not a PDF")]
    NotPdf,
    #[error("failed reading upload body: {0}")]
    Read(io::Error),
    #[error("failed writing upload: {0}")]
    Write(io::Error),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::TooLarge { limit } => {
                ApiError::payload_too_large(format!("PDF exceeds the {limit} byte upload limit"))
            }
            IngestError::NotPdf => ApiError::unsupported_media_type("Uploaded file is not a PDF"),
            IngestError::Read(err) => {
                warn!("Failed to read upload body: {}", err);
                ApiError::bad_request("Failed to read upload")
            }
            IngestError::Write(err) => {
                error!("Failed to store upload: {}", err);
                ApiError::internal("Failed to store upload")
            }
        }
    }
}

fn read_error(err: io::Error) -> IngestError {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<UploadSizeExceeded>())
    {
        Some(exceeded) => IngestError::TooLarge {
            limit: exceeded.limit,
        },
        None => IngestError::Read(err),
    }
}

struct StoredFile {
    size_bytes: u64,
    sha256: String,
}

/// Streams `reader` into `path`, hashing as it goes and checking the PDF
/// signature once enough bytes have arrived.
async fn write_pdf<R>(mut reader: R, path: &Path) -> Result<StoredFile, IngestError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut file = fs::File::create(path).await.map_err(IngestError::Write)?;
    let mut hasher = Sha256::new();
    let mut signature = Vec::with_capacity(PDF_SIGNATURE.len());
    let mut size_bytes: u64 = 0;
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = reader.read(&mut buf).await.map_err(read_error)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];

        if signature.len() < PDF_SIGNATURE.len() {
            let take = (PDF_SIGNATURE.len() - signature.len()).min(n);
            signature.extend_from_slice(&chunk[..take]);
            if !PDF_SIGNATURE.starts_with(&signature) {
                return Err(IngestError::NotPdf);
            }
        }

        hasher.update(chunk);
        file.write_all(chunk).await.map_err(IngestError::Write)?;
        size_bytes += n as u64;
    }

    if signature != PDF_SIGNATURE {
        return Err(IngestError::NotPdf);
    }

    file.flush().await.map_err(IngestError::Write)?;

    Ok(StoredFile {
        size_bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Keeps only the final path component of a client supplied name.
pub fn sanitize_filename(name: Option<&str>) -> String {
    name.and_then(|n| n.rsplit(['/', '\\']).next())
        .map(str::trim)
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map_or_else(|| FALLBACK_FILENAME.to_string(), str::to_string)
}

pub async fn upload_pdf(
    State(store): State<UploadStore>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        warn!("Malformed multipart upload: {}", err);
        ApiError::bad_request("Malformed multipart body")
    })? {
        if !field.name().is_some_and(|name| FILE_FIELDS.contains(&name)) {
            continue;
        }

        let filename = sanitize_filename(field.file_name());
        let upload_id = Uuid::new_v4();
        let path = store.path_for(&upload_id);

        let stream = field.map(|result| result.map_err(io::Error::other));
        let limited = SizeLimitedStream::new(stream, store.max_bytes);
        let stored = match write_pdf(StreamReader::new(limited), &path).await {
            Ok(stored) => stored,
            Err(err) => {
                if let Err(rm_err) = fs::remove_file(&path).await {
                    if rm_err.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove partial upload {}: {}", path.display(), rm_err);
                    }
                }
                return Err(err.into());
            }
        };

        let received_at: DateTime<Utc> = Utc::now();
        info!(
            "Stored upload {} ({}, {} bytes)",
            upload_id, filename, stored.size_bytes
        );

        return Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                upload_id: upload_id.to_string(),
                filename,
                size_bytes: stored.size_bytes,
                sha256: stored.sha256,
                received_at: received_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            }),
        ));
    }

    Err(ApiError::bad_request(
        "Missing PDF file field (expected \"pdf\" or \"file\")",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    type Ingested = (Result<StoredFile, IngestError>, PathBuf, tempfile::TempDir);

    fn chunks(
        parts: &[&'static [u8]],
    ) -> impl Stream<Item = Result<Bytes, io::Error>> + Unpin + Send {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
    }

    async fn ingest(parts: &[&'static [u8]], max: usize) -> Ingested {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("doc.pdf");
        let reader = StreamReader::new(SizeLimitedStream::new(chunks(parts), max));
        (write_pdf(reader, &path).await, path, dir)
    }

    #[tokio::test]
    async fn stores_pdf_split_across_chunks() {
        let (result, path, _dir) = ingest(&[b"%P", b"DF-1.7\n", b"body"], 1024).await;
        let stored = result.expect("stored");

        let expected = b"%PDF-1.7\nbody";
        assert_eq!(stored.size_bytes, expected.len() as u64);
        assert_eq!(stored.sha256, hex::encode(Sha256::digest(expected)));
        assert_eq!(fs::read(&path).await.expect("file"), expected);
    }

    #[tokio::test]
    async fn rejects_non_pdf_early() {
        let (result, _, _dir) = ingest(&[b"PK\x03\x04", b"zip data"], 1024).await;
        assert!(matches!(result, Err(IngestError::NotPdf)));
    }

    #[tokio::test]
    async fn rejects_truncated_signature() {
        let (result, _, _dir) = ingest(&[b"%PD"], 1024).await;
        assert!(matches!(result, Err(IngestError::NotPdf)));

        let (result, _, _dir) = ingest(&[], 1024).await;
        assert!(matches!(result, Err(IngestError::NotPdf)));
    }

    #[tokio::test]
    async fn size_limit_surfaces_as_too_large() {
        let (result, _, _dir) = ingest(&[b"%PDF-1.4\n", &[b'x'; 64]], 32).await;
        assert!(matches!(result, Err(IngestError::TooLarge { limit: 32 })));
    }

    #[tokio::test]
    async fn size_limit_allows_exact_fit() {
        let (result, _, _dir) = ingest(&[b"%PDF-", b"123"], 8).await;
        assert_eq!(result.expect("stored").size_bytes, 8);
    }

    #[test]
    fn filenames_are_reduced_to_last_component() {
        assert_eq!(sanitize_filename(Some("report.pdf")), "report.pdf");
        assert_eq!(sanitize_filename(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_filename(Some("C:\\docs\\cv.pdf")), "cv.pdf");
        assert_eq!(sanitize_filename(Some("dir/")), FALLBACK_FILENAME);
        assert_eq!(sanitize_filename(Some("..")), FALLBACK_FILENAME);
        assert_eq!(sanitize_filename(None), FALLBACK_FILENAME);
    }
}
