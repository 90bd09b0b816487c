//! Production implementations of the external collaborator traits, backed
//! by `reqwest` HTTP calls and a local DOCX reader. These are the pieces
//! wired into the `worker` binary at startup; tests substitute
//! hand-written fakes implementing the same traits instead.

use std::io::{Cursor, Read};
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::Client;
use serde_json::json;

use crate::error::CollaboratorError;

use super::{
    BlobLocation, BlobStore, CodingRequest, CodingResponse, DocxExtractor, LlmService, OcrResult,
    OcrService, SummaryRequest,
};

/// An OCR collaborator that posts the file at `file_path` as a multipart
/// `pdf` field to a configured OCR HTTP service, per §6.
pub struct ReqwestOcrService {
    client: Client,
    base_url: String,
}

impl ReqwestOcrService {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl OcrService for ReqwestOcrService {
    async fn extract(&self, file_path: &Path) -> Result<OcrResult, CollaboratorError> {
        let started = Instant::now();

        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|error| CollaboratorError::BlobIo(error.to_string()))?;

        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_owned());

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("pdf", part);

        let response = self
            .client
            .post(format!("{}/ocr", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|error| request_error(error, started.elapsed(), CollaboratorError::ExtractionFailed))?;

        if !response.status().is_success() {
            return Err(CollaboratorError::ExtractionFailed(format!(
                "OCR service returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|error| CollaboratorError::ExtractionFailed(error.to_string()))?;

        let text = body
            .get("text")
            .and_then(|value| value.as_str())
            .ok_or_else(|| CollaboratorError::ExtractionFailed("missing `text` field".to_owned()))?
            .to_owned();

        Ok(OcrResult {
            text,
            elapsed: started.elapsed(),
        })
    }
}

/// An LLM collaborator speaking a chat-style HTTP API. Temperature and
/// max-output-tokens are fixed per §6.
pub struct ReqwestLlmService {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ReqwestLlmService {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn system_prompt() -> &'static str {
        "You are a medical coding expert. Given line-numbered clinical \
         document text and chart metadata, return structured ICD-10/CPT \
         coding data as JSON."
    }
}

#[async_trait]
impl LlmService for ReqwestLlmService {
    async fn synthesize_codes(
        &self,
        request: CodingRequest,
    ) -> Result<CodingResponse, CollaboratorError> {
        let started = Instant::now();
        let user_prompt = format_coding_prompt(&request);

        let body = json!({
            "model": self.model,
            "temperature": 0.1,
            "max_tokens": 12_000,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": Self::system_prompt() },
                { "role": "user", "content": user_prompt },
            ],
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| request_error(error, started.elapsed(), CollaboratorError::AiFailed))?;

        if !response.status().is_success() {
            return Err(CollaboratorError::AiFailed(format!(
                "LLM service returned {}",
                response.status()
            )));
        }

        let raw = response
            .text()
            .await
            .map_err(|error| CollaboratorError::AiFailed(error.to_string()))?;

        let envelope: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|error| CollaboratorError::AiFailed(error.to_string()))?;
        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(|value| value.as_str())
            .ok_or_else(|| CollaboratorError::AiFailed("missing coding content".to_owned()))?;

        let data = parse_json_lenient(content)
            .ok_or_else(|| CollaboratorError::AiFailed("unparseable LLM response".to_owned()))?;

        Ok(CodingResponse {
            ok: true,
            data: Some(data),
        })
    }

    async fn summarize_document(
        &self,
        request: SummaryRequest,
    ) -> Result<String, CollaboratorError> {
        let started = Instant::now();
        let body = json!({
            "model": self.model,
            "temperature": 0.1,
            "max_tokens": 500,
            "messages": [
                { "role": "system", "content": "Summarize this clinical document in two sentences." },
                { "role": "user", "content": request.text },
            ],
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| request_error(error, started.elapsed(), CollaboratorError::AiFailed))?;

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|error| CollaboratorError::AiFailed(error.to_string()))?;

        value
            .pointer("/choices/0/message/content")
            .and_then(|value| value.as_str())
            .map(|text| text.to_owned())
            .ok_or_else(|| CollaboratorError::AiFailed("missing summary content".to_owned()))
    }
}

/// Format the documents as line-numbered sequences plus chart metadata, as
/// required by §6.
fn format_coding_prompt(request: &CodingRequest) -> String {
    let mut prompt = format!(
        "Chart number: {}\nMetadata: {}\n\n",
        request.chart_number, request.metadata
    );

    for document in &request.documents {
        prompt.push_str(&format!("--- document {} ---\n", document.document_id));
        for (index, line) in document.text.lines().enumerate() {
            prompt.push_str(&format!("{:>5}: {}\n", index + 1, line));
        }
        prompt.push('\n');
    }

    prompt
}

/// Map a failed `reqwest` send into the matching collaborator error,
/// distinguishing the client-side timeout (per the 60s default on the
/// worker's HTTP client) from every other transport failure.
fn request_error(
    error: reqwest::Error,
    elapsed: std::time::Duration,
    fallback: impl FnOnce(String) -> CollaboratorError,
) -> CollaboratorError {
    if error.is_timeout() {
        CollaboratorError::Timeout(elapsed)
    } else {
        fallback(error.to_string())
    }
}

/// Parse `raw` as JSON, falling back to extracting the first `{...}`
/// substring if the whole body doesn't parse -- the documented
/// last-resort per §6.
fn parse_json_lenient(raw: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str(raw) {
        return Some(value);
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }

    serde_json::from_str(&raw[start..=end]).ok()
}

/// A minimal S3-compatible blob store client built directly on `reqwest`
/// rather than a full SDK, matching the rest of the worker's "plain HTTP
/// client to an external collaborator" style.
pub struct HttpBlobStore {
    client: Client,
    endpoint: String,
    bucket: String,
}

impl HttpBlobStore {
    pub fn new(client: Client, endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            bucket: bucket.into(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, key: &str) -> Result<Bytes, CollaboratorError> {
        let started = Instant::now();
        let response = self
            .client
            .get(self.object_url(key))
            .send()
            .await
            .map_err(|error| request_error(error, started.elapsed(), CollaboratorError::BlobIo))?;

        if !response.status().is_success() {
            return Err(CollaboratorError::BlobIo(format!(
                "GET {} returned {}",
                key,
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|error| CollaboratorError::BlobIo(error.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<BlobLocation, CollaboratorError> {
        let started = Instant::now();
        let response = self
            .client
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|error| request_error(error, started.elapsed(), CollaboratorError::BlobIo))?;

        if !response.status().is_success() {
            return Err(CollaboratorError::BlobIo(format!(
                "PUT {} returned {}",
                key,
                response.status()
            )));
        }

        Ok(BlobLocation {
            key: key.to_owned(),
            url: self.object_url(key),
            bucket: self.bucket.clone(),
        })
    }

    async fn presigned_url(&self, key: &str) -> Result<String, CollaboratorError> {
        Ok(self.object_url(key))
    }
}

/// Extract plain text from a `.docx` file by unzipping `word/document.xml`
/// and concatenating every `<w:t>` run, in document order.
pub struct WordXmlExtractor;

impl DocxExtractor for WordXmlExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, CollaboratorError> {
        let cursor = Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(cursor)
            .map_err(|error| CollaboratorError::ExtractionFailed(error.to_string()))?;

        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|error| CollaboratorError::ExtractionFailed(error.to_string()))?
            .read_to_string(&mut xml)
            .map_err(|error| CollaboratorError::ExtractionFailed(error.to_string()))?;

        extract_runs(&xml).map_err(|error| CollaboratorError::ExtractionFailed(error.to_string()))
    }
}

fn extract_runs(xml: &str) -> Result<String, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut text = String::new();
    let mut in_text_run = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"t" => in_text_run = true,
            Event::End(ref e) if e.local_name().as_ref() == b"t" => in_text_run = false,
            Event::Text(e) if in_text_run => {
                text.push_str(&e.unescape()?);
            }
            Event::Start(ref e) if e.local_name().as_ref() == b"p" => {
                if !text.is_empty() {
                    text.push('\n');
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(text)
}
