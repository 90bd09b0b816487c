//! The four external collaborators described in §6: blob store, OCR
//! service, LLM service, and DOCX extractor. Each is a small
//! `async_trait` so the worker can be tested against hand-written fakes
//! instead of real network services.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CollaboratorError;

pub mod http;

/// Where a blob landed in object storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobLocation {
    pub key: String,
    pub url: String,
    pub bucket: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Bytes, CollaboratorError>;
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<BlobLocation, CollaboratorError>;
    async fn presigned_url(&self, key: &str) -> Result<String, CollaboratorError>;
}

/// Outcome of one document's text extraction attempt.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    pub elapsed: Duration,
}

#[async_trait]
pub trait OcrService: Send + Sync {
    /// Download the file to a temp path happens in the worker; this trait
    /// only covers the HTTP call itself, posting the file at `file_path`
    /// as the `pdf` multipart field per §6.
    async fn extract(&self, file_path: &Path) -> Result<OcrResult, CollaboratorError>;
}

/// One line-numbered document's worth of extracted text, as handed to the
/// LLM collaborator alongside chart metadata.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentText {
    pub document_id: i64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodingRequest {
    pub chart_number: String,
    pub metadata: Value,
    pub documents: Vec<DocumentText>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodingResponse {
    pub ok: bool,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRequest {
    pub document_id: i64,
    pub text: String,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn synthesize_codes(
        &self,
        request: CodingRequest,
    ) -> Result<CodingResponse, CollaboratorError>;

    async fn summarize_document(
        &self,
        request: SummaryRequest,
    ) -> Result<String, CollaboratorError>;
}

/// Synchronous -- local CPU-bound parsing of a Word document's XML, no
/// network involved.
pub trait DocxExtractor: Send + Sync {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, CollaboratorError>;
}
