//! Vision-model analysis boundary.
//!
//! The [`Analyzer`] trait is the only thing the reconciler knows about the
//! external model: bytes and a prompt go in, a short name and description
//! come out. Every call is a single attempt; retrying is the caller's job.

pub mod client;

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use serde::Deserialize;
use thiserror::Error;

pub use client::VisionClient;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("invalid analysis payload: {0}")]
    InvalidPayload(String),

    #[error("cannot decode image {}: {message}", path.display())]
    Decode { path: PathBuf, message: String },

    #[error("failed to read image {}: {source}", path.display())]
    ReadImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Successful result of analyzing one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub short_name: String,
    pub description: String,
    /// Model that produced the result, as reported by the API.
    pub model_id: String,
}

/// Common interface for image analysis backends
pub trait Analyzer: Send + Sync {
    /// Analyze one image. `media_type` is the MIME type of `image`.
    fn analyze(
        &self,
        image: &[u8],
        media_type: &str,
        prompt: &str,
    ) -> impl std::future::Future<Output = Result<Analysis, AnalysisError>> + Send;
}

/// Media type of every image [`analyze_file`] hands to an analyzer.
pub const NORMALIZED_MEDIA_TYPE: &str = "image/png";

/// Read `path`, normalize it to PNG and run it through `analyzer`.
///
/// Images that cannot be read or decoded fail here without reaching the
/// analyzer.
pub async fn analyze_file<A: Analyzer>(
    analyzer: &A,
    path: &Path,
    prompt: &str,
) -> Result<Analysis, AnalysisError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| AnalysisError::ReadImage {
            path: path.to_path_buf(),
            source,
        })?;

    let decode_error = |message: String| AnalysisError::Decode {
        path: path.to_path_buf(),
        message,
    };
    let png = tokio::task::spawn_blocking(move || encode_png(&raw))
        .await
        .map_err(|e| decode_error(format!("decoder task failed: {e}")))?
        .map_err(|e| decode_error(e.to_string()))?;

    analyzer.analyze(&png, NORMALIZED_MEDIA_TYPE, prompt).await
}

/// Decode an image in any supported format and re-encode it as RGBA PNG.
pub fn encode_png(raw: &[u8]) -> image::ImageResult<Vec<u8>> {
    let rgba = image::load_from_memory(raw)?.to_rgba8();
    let mut out = Cursor::new(Vec::new());
    rgba.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    short_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Parse the model's message content into `(short_name, description)`.
///
/// The content must be a JSON object whose `short_name` and `description`
/// are both non-empty strings. A surrounding Markdown code fence is ignored.
pub fn parse_payload(content: &str) -> Result<(String, String), AnalysisError> {
    let json = strip_code_fence(content);
    let payload: Payload = serde_json::from_str(json)
        .map_err(|e| AnalysisError::InvalidPayload(format!("content is not the expected JSON: {e}")))?;

    let short_name = non_empty(payload.short_name, "short_name")?;
    let description = non_empty(payload.description, "description")?;
    Ok((short_name, description))
}

fn non_empty(value: Option<String>, field: &str) -> Result<String, AnalysisError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AnalysisError::InvalidPayload(format!(
            "missing or empty {field}"
        ))),
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}
