//! Document extraction — turn uploaded bytes into prompt-ready text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One uploaded file the model may be told about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub media_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Result of extracting text from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub text: String,
    #[serde(default)]
    pub metadata: ExtractionMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionMetadata {
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_estimated_length: Option<usize>,
}

/// Document ingestion service.
///
/// Extraction never fails: unreadable input yields a human-readable
/// fallback string in `text`.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], media_type: &str) -> Extraction;
}

/// Extractor for textual media types. Anything else gets the fallback text.
pub struct PlainTextExtractor {
    max_chars: usize,
}

impl PlainTextExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    fn is_textual(media_type: &str) -> bool {
        let essence = media_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        essence.starts_with("text/")
            || matches!(
                essence.as_str(),
                "application/json" | "application/xml" | "application/x-yaml" | "application/toml"
            )
    }
}

impl Default for PlainTextExtractor {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl DocumentExtractor for PlainTextExtractor {
    async fn extract(&self, bytes: &[u8], media_type: &str) -> Extraction {
        if !Self::is_textual(media_type) {
            tracing::debug!(media_type, bytes = bytes.len(), "No text extractor for media type");
            return Extraction {
                text: format!("[Unable to extract text from a {media_type} document]"),
                metadata: ExtractionMetadata::default(),
            };
        }

        let text = String::from_utf8_lossy(bytes);
        let total = text.chars().count();
        if total <= self.max_chars {
            return Extraction {
                text: text.into_owned(),
                metadata: ExtractionMetadata::default(),
            };
        }

        Extraction {
            text: text.chars().take(self.max_chars).collect(),
            metadata: ExtractionMetadata {
                truncated: true,
                original_estimated_length: Some(total),
            },
        }
    }
}
