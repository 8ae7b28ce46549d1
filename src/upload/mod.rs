//! # Chunked upload
//!
//! Uploads a local file to the platform's file service under the agent's
//! current access token, optionally split into fixed-size chunks.
//!
//! ```text
//!   file ──▶ [0..n) [n..2n) [2n..len) ──▶ at most `parallel_uploads` in flight
//!                                              │ each chunk retried on its own
//!                                              ▼
//!                                   POST ?upload=complete ──▶ { md5, etag }
//!                                              │
//!                                   compare with local MD5
//! ```
//!
//! Chunks carry `Content-Range: bytes first-last/total`, so the platform
//! places each one by offset and chunks may finish in any order. A chunk that
//! keeps failing surfaces as [`AgentError::ChunkFailed`] with its index;
//! passing that index as `start_chunk` resumes without re-sending the chunks
//! before it. Each request asks the token manager for a token, so a token that
//! expires mid-upload is replaced transparently, and a `401` drops the refused
//! token before the retry.

#![allow(missing_docs)]

use crate::agent::error::{AgentError, Operation, TransientCause};
use crate::agent::{Context, TokenManager};
use crate::config::UploadSettings;
use crate::network::retry::{RetryPolicy, retry};
use crate::network::{Body, Part, Request, Response};
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use serde::Deserialize;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub path: PathBuf,
    pub mime_type: String,
    pub description: Option<String>,
    pub chunked: bool,
    /// Chunk size when chunked, otherwise the largest file accepted.
    pub max_size_bytes: usize,
    /// First chunk to send; earlier chunks are assumed to be on the platform already.
    pub start_chunk: usize,
    /// Path on the platform. Defaults to the local file name.
    pub target_path: Option<String>,
    pub parallel_uploads: usize,
    /// Entity tag the existing file must have for the upload to overwrite it.
    pub if_match: Option<String>,
    pub retry: RetryPolicy,
}

impl UploadRequest {
    pub fn new(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        let defaults = UploadSettings::default();
        Self {
            path: path.into(),
            mime_type: mime_type.into(),
            description: None,
            chunked: false,
            max_size_bytes: defaults.chunk_size,
            start_chunk: 0,
            target_path: None,
            parallel_uploads: defaults.parallel_uploads,
            if_match: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn chunked(mut self, chunk_size: usize) -> Self {
        self.chunked = true;
        self.max_size_bytes = chunk_size;
        self
    }

    pub fn start_chunk(mut self, index: usize) -> Self {
        self.start_chunk = index;
        self
    }

    pub fn target_path(mut self, target: impl Into<String>) -> Self {
        self.target_path = Some(target.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn parallel_uploads(mut self, parallel: usize) -> Self {
        self.parallel_uploads = parallel;
        self
    }

    pub fn if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

/// One byte range of an upload. Lives only for the duration of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    pub index: usize,
    pub range: Range<usize>,
    pub content: Vec<u8>,
    pub target_path: String,
    /// Which wave of `parallel_uploads` requests the chunk is scheduled in.
    pub group: usize,
}

impl UploadChunk {
    /// `Content-Range` value, e.g. `bytes 0-1023/3000`.
    pub fn content_range(&self, total: usize) -> String {
        format!(
            "bytes {}-{}/{}",
            self.range.start,
            self.range.end.saturating_sub(1),
            total
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Hex MD5 of the assembled file, as confirmed by the platform.
    pub md5: String,
    pub etag: Option<String>,
    pub chunks_uploaded: usize,
    pub total_chunks: usize,
}

/// Platform answer to a single upload or to the finalize request.
#[derive(Debug, Deserialize)]
struct Stored {
    md5: String,
    #[serde(default)]
    etag: Option<String>,
}

/// Splits `len` bytes into ranges of `chunk_size`.
pub fn plan_chunks(len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let chunk_size = chunk_size.max(1);
    (0..len)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(len))
        .collect()
}

/// Lowercase hex MD5.
pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Uploads files on behalf of one agent. Cheap to clone.
#[derive(Clone)]
pub struct Uploader {
    ctx: Arc<Context>,
    tokens: Arc<TokenManager>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("client_id", &self.ctx.client_id())
            .finish_non_exhaustive()
    }
}

impl Uploader {
    pub(crate) fn new(ctx: Arc<Context>, tokens: Arc<TokenManager>) -> Self {
        Self { ctx, tokens }
    }

    /// A request pre-filled with the agent's upload and retry settings.
    pub fn request(&self, path: impl Into<PathBuf>, mime_type: impl Into<String>) -> UploadRequest {
        let settings = &self.ctx.settings;
        let mut request = UploadRequest::new(path, mime_type)
            .parallel_uploads(settings.upload.parallel_uploads)
            .retry(settings.retry);
        request.max_size_bytes = settings.upload.chunk_size;
        request
    }

    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadOutcome, AgentError> {
        let client_id = self.ctx.client_id();
        let display_path = request.path.display().to_string();
        if request.chunked && request.max_size_bytes == 0 {
            return Err(AgentError::invalid(
                Operation::Upload,
                client_id,
                format!("chunk size for {display_path} must be at least one byte"),
            ));
        }
        let bytes = tokio::fs::read(&request.path)
            .await
            .map_err(|source| AgentError::Io {
                client_id: client_id.to_owned(),
                path: display_path.clone(),
                source,
            })?;
        let local_md5 = md5_hex(&bytes);
        let target = self.target_path(request)?;
        let url = format!(
            "{}/{}",
            self.ctx.endpoints.upload.trim_end_matches('/'),
            target.trim_start_matches('/')
        );

        let (stored, chunks_uploaded, total_chunks) = if request.chunked {
            self.upload_chunked(request, &bytes, &url, &target).await?
        } else {
            if bytes.len() > request.max_size_bytes {
                return Err(AgentError::invalid(
                    Operation::Upload,
                    client_id,
                    format!(
                        "{display_path} is {} bytes, more than the {} allowed without chunking",
                        bytes.len(),
                        request.max_size_bytes
                    ),
                ));
            }
            let stored = retry(request.retry, || self.send_whole(request, &bytes, &url, &target))
                .await?;
            (stored, 1, 1)
        };

        if !stored.md5.eq_ignore_ascii_case(&local_md5) {
            return Err(AgentError::ChecksumMismatch {
                client_id: client_id.to_owned(),
                path: target,
                local: local_md5,
                remote: stored.md5,
            });
        }
        tracing::info!(client_id, path = %target, md5 = %local_md5, total_chunks, "upload complete");
        Ok(UploadOutcome {
            md5: local_md5,
            etag: stored.etag,
            chunks_uploaded,
            total_chunks,
        })
    }

    fn target_path(&self, request: &UploadRequest) -> Result<String, AgentError> {
        if let Some(target) = &request.target_path {
            return Ok(target.clone());
        }
        request
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                AgentError::invalid(
                    Operation::Upload,
                    self.ctx.client_id(),
                    format!("{} has no file name", request.path.display()),
                )
            })
    }

    async fn upload_chunked(
        &self,
        request: &UploadRequest,
        bytes: &[u8],
        url: &str,
        target: &str,
    ) -> Result<(Stored, usize, usize), AgentError> {
        let parallel = request.parallel_uploads.max(1);
        let ranges = plan_chunks(bytes.len(), request.max_size_bytes);
        let total_chunks = ranges.len();
        let chunks: Vec<UploadChunk> = ranges
            .into_iter()
            .enumerate()
            .skip(request.start_chunk)
            .map(|(index, range)| UploadChunk {
                index,
                content: bytes[range.clone()].to_vec(),
                range,
                target_path: target.to_owned(),
                group: (index - request.start_chunk) / parallel,
            })
            .collect();
        let pending = chunks.len();
        tracing::debug!(
            client_id = %self.ctx.client_id(),
            path = target,
            total_chunks,
            pending,
            parallel,
            "uploading chunks"
        );

        let results: Vec<(usize, Result<(), AgentError>)> = stream::iter(chunks)
            .map(|chunk| async move {
                let index = chunk.index;
                let sent = retry(request.retry, || {
                    self.send_chunk(request, &chunk, bytes.len(), url)
                })
                .await;
                (index, sent)
            })
            .buffer_unordered(parallel)
            .collect()
            .await;

        if let Some((index, err)) = results
            .into_iter()
            .filter_map(|(index, sent)| sent.err().map(|err| (index, err)))
            .min_by_key(|(index, _)| *index)
        {
            return Err(AgentError::ChunkFailed {
                client_id: self.ctx.client_id().to_owned(),
                path: target.to_owned(),
                index,
                source: Box::new(err),
            });
        }

        let stored = retry(request.retry, || self.finalize(request, url)).await?;
        Ok((stored, pending, total_chunks))
    }

    /// Sends `request` with the current access token. A `401` drops that token
    /// and is retryable.
    async fn send_authorized(
        &self,
        request: Request,
        upload: &UploadRequest,
    ) -> Result<Response, AgentError> {
        let op = Operation::Upload;
        let token = self.tokens.get_token().await?.access_token;
        let mut request = request.bearer(&token);
        if let Some(etag) = &upload.if_match {
            request = request.and_then(|r| r.with_header("If-Match", etag.as_str()));
        }
        let request =
            request.map_err(|e| AgentError::invalid(op, self.ctx.client_id(), e.to_string()))?;

        let response = self.ctx.send(op, request).await?;
        if response.is_success() {
            return Ok(response);
        }
        if response.status_code == 401 {
            self.tokens.reject(&token).await?;
            return Err(AgentError::transient(
                op,
                self.ctx.client_id(),
                TransientCause::Unauthorized,
            ));
        }
        Err(self.ctx.unexpected(op, &response))
    }

    async fn send_chunk(
        &self,
        upload: &UploadRequest,
        chunk: &UploadChunk,
        total: usize,
        url: &str,
    ) -> Result<(), AgentError> {
        let body = Body::Multipart(vec![Part::File {
            name: "file".to_owned(),
            file_name: chunk.target_path.clone(),
            mime_type: upload.mime_type.clone(),
            content: chunk.content.clone(),
        }]);
        let request = Request::post(url, body)
            .with_header("Content-Range", chunk.content_range(total))
            .map_err(|e| AgentError::invalid(Operation::Upload, self.ctx.client_id(), e.to_string()))?;

        self.send_authorized(request, upload).await?;
        tracing::debug!(client_id = %self.ctx.client_id(), index = chunk.index, group = chunk.group, "chunk stored");
        Ok(())
    }

    async fn send_whole(
        &self,
        upload: &UploadRequest,
        bytes: &[u8],
        url: &str,
        target: &str,
    ) -> Result<Stored, AgentError> {
        let mut parts = Vec::with_capacity(2);
        if let Some(description) = &upload.description {
            parts.push(Part::Text {
                name: "description".to_owned(),
                value: description.clone(),
            });
        }
        parts.push(Part::File {
            name: "file".to_owned(),
            file_name: target.to_owned(),
            mime_type: upload.mime_type.clone(),
            content: bytes.to_vec(),
        });
        let response = self
            .send_authorized(Request::post(url, Body::Multipart(parts)), upload)
            .await?;
        self.stored(&response)
    }

    async fn finalize(&self, upload: &UploadRequest, url: &str) -> Result<Stored, AgentError> {
        let mut form = vec![("mime_type".to_owned(), upload.mime_type.clone())];
        if let Some(description) = &upload.description {
            form.push(("description".to_owned(), description.clone()));
        }
        let request = Request::post(format!("{url}?upload=complete"), Body::Form(form));
        let response = self.send_authorized(request, upload).await?;
        self.stored(&response)
    }

    fn stored(&self, response: &Response) -> Result<Stored, AgentError> {
        response
            .json()
            .map_err(|e| AgentError::invalid(Operation::Upload, self.ctx.client_id(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_fixed_size_ranges_with_short_tail() {
        assert_eq!(plan_chunks(3000, 1024), vec![0..1024, 1024..2048, 2048..3000]);
        assert_eq!(plan_chunks(2048, 1024), vec![0..1024, 1024..2048]);
        assert!(plan_chunks(0, 1024).is_empty());
    }

    #[test]
    fn content_range_is_inclusive() {
        let chunk = UploadChunk {
            index: 2,
            range: 2048..3000,
            content: vec![0; 952],
            target_path: "data.bin".into(),
            group: 0,
        };
        assert_eq!(chunk.content_range(3000), "bytes 2048-2999/3000");
    }

    #[test]
    fn md5_is_lowercase_hex() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn builder_sets_chunking() {
        let request = UploadRequest::new("/tmp/data.bin", "application/octet-stream")
            .chunked(1024)
            .start_chunk(2)
            .if_match("\"etag-1\"");
        assert!(request.chunked);
        assert_eq!(request.max_size_bytes, 1024);
        assert_eq!(request.start_chunk, 2);
        assert_eq!(request.if_match.as_deref(), Some("\"etag-1\""));
    }
}
