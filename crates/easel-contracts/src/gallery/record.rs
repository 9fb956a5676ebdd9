use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One generated image as kept in the gallery.
///
/// The wire shape is the camelCase object the stored collection has always used:
/// `{id, imageUrl | imageData, originalPrompt, revisedPrompt}`. Exactly one payload
/// field is present per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecordRow", into = "RecordRow")]
pub struct GeneratedImage {
    pub id: String,
    pub payload: ImagePayload,
    pub original_prompt: String,
    pub revised_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// Time-limited signed locator returned by the service.
    Remote { url: String },
    /// `data:<mime>;base64,<payload>` URL.
    Embedded { data: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record has an empty id")]
    EmptyId,
    #[error("record {0} carries neither imageUrl nor imageData")]
    MissingPayload(String),
    #[error("record {0} carries both imageUrl and imageData")]
    AmbiguousPayload(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordRow {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_data: Option<String>,
    original_prompt: String,
    revised_prompt: String,
}

pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

impl GeneratedImage {
    /// Builds a record with a fresh id. A missing revised prompt falls back to the original.
    pub fn new(
        payload: ImagePayload,
        original_prompt: impl Into<String>,
        revised_prompt: Option<String>,
    ) -> Self {
        let original_prompt = original_prompt.into();
        let revised_prompt = revised_prompt
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| original_prompt.clone());
        Self {
            id: new_record_id(),
            payload,
            original_prompt,
            revised_prompt,
        }
    }
}

impl ImagePayload {
    pub fn remote(url: impl Into<String>) -> Self {
        Self::Remote { url: url.into() }
    }

    pub fn embedded(mime: &str, bytes: &[u8]) -> Self {
        Self::Embedded {
            data: format!("data:{mime};base64,{}", BASE64.encode(bytes)),
        }
    }

    /// Wraps an already base64-encoded body, as returned by `b64_json` responses.
    pub fn embedded_base64(mime: &str, b64: &str) -> Self {
        Self::Embedded {
            data: format!("data:{mime};base64,{}", b64.trim()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Remote { .. } => "url",
            Self::Embedded { .. } => "data",
        }
    }

    /// The string an `<img src>` would take.
    pub fn locator(&self) -> &str {
        match self {
            Self::Remote { url } => url,
            Self::Embedded { data } => data,
        }
    }

    /// Splits an embedded payload into `(mime, base64 body)`.
    pub fn data_url_parts(&self) -> Option<(&str, &str)> {
        let Self::Embedded { data } = self else {
            return None;
        };
        let rest = data.strip_prefix("data:")?;
        let (header, body) = rest.split_once(',')?;
        let mime = header.strip_suffix(";base64")?;
        Some((if mime.is_empty() { "image/png" } else { mime }, body))
    }

    /// Size in bytes of the stored locator, used for capacity reporting.
    pub fn stored_len(&self) -> usize {
        self.locator().len()
    }
}

impl TryFrom<RecordRow> for GeneratedImage {
    type Error = RecordError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        if row.id.trim().is_empty() {
            return Err(RecordError::EmptyId);
        }
        let payload = match (row.image_url, row.image_data) {
            (Some(url), None) => ImagePayload::Remote { url },
            (None, Some(data)) => ImagePayload::Embedded { data },
            (None, None) => return Err(RecordError::MissingPayload(row.id)),
            (Some(_), Some(_)) => return Err(RecordError::AmbiguousPayload(row.id)),
        };
        Ok(Self {
            id: row.id,
            payload,
            original_prompt: row.original_prompt,
            revised_prompt: row.revised_prompt,
        })
    }
}

impl From<GeneratedImage> for RecordRow {
    fn from(image: GeneratedImage) -> Self {
        let (image_url, image_data) = match image.payload {
            ImagePayload::Remote { url } => (Some(url), None),
            ImagePayload::Embedded { data } => (None, Some(data)),
        };
        Self {
            id: image.id,
            image_url,
            image_data,
            original_prompt: image.original_prompt,
            revised_prompt: image.revised_prompt,
        }
    }
}
