use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use easel_contracts::gallery::{ImagePayload, NO_IMAGE_FOUND_MESSAGE};
use image::{ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "dall-e-3";
/// Large images with embedded payloads can take minutes to come back.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Embedded base64 image; survives the service's locator expiry.
    #[default]
    B64Json,
    Url,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::B64Json => "b64_json",
            Self::Url => "url",
        }
    }
}

impl std::str::FromStr for ResponseFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "b64_json" | "b64" => Ok(Self::B64Json),
            "url" => Ok(Self::Url),
            other => Err(format!("unknown response format '{other}' (expected b64_json or url)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub api_key: String,
    pub prompt: String,
    pub model: String,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub payload: ImagePayload,
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerateError {
    /// The call completed but carried no usable image.
    #[error("{}", NO_IMAGE_FOUND_MESSAGE)]
    NoImage,
    /// Network, authorization, quota or any other service-reported failure.
    #[error("{message}")]
    Service {
        status: Option<u16>,
        message: String,
    },
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, GenerateError>;
}

#[derive(Default)]
pub struct GeneratorRegistry {
    generators: BTreeMap<String, Box<dyn ImageGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ImageGenerator + 'static>(&mut self, generator: G) {
        self.generators
            .insert(generator.name().to_string(), Box::new(generator));
    }

    /// Moves a generator out of the registry, e.g. to share it with a worker thread.
    pub fn take(&mut self, name: &str) -> Option<Box<dyn ImageGenerator>> {
        self.generators.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.generators.keys().cloned().collect()
    }
}

pub fn default_generator_registry(api_base: &str) -> GeneratorRegistry {
    let mut generators = GeneratorRegistry::new();
    generators.register(DryrunGenerator);
    generators.register(OpenAiImages::new(api_base));
    generators
}

/// OpenAI `images/generations` client.
pub struct OpenAiImages {
    api_base: String,
    timeout: Duration,
    http: HttpClient,
}

impl OpenAiImages {
    pub fn new(api_base: &str) -> Self {
        let api_base = api_base.trim().trim_end_matches('/');
        Self {
            api_base: if api_base.is_empty() {
                DEFAULT_API_BASE.to_string()
            } else {
                api_base.to_string()
            },
            timeout: DEFAULT_REQUEST_TIMEOUT,
            http: HttpClient::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn endpoint(&self) -> String {
        format!("{}/images/generations", self.api_base)
    }
}

impl OpenAiImages {
    /// reqwest's own message names only the URL; the cause chain says what went wrong.
    fn transport_message(&self, err: reqwest::Error) -> String {
        let timed_out = err.is_timeout();
        let chain = format!("{:#}", anyhow::Error::new(err));
        tracing::warn!(error = %chain, timed_out, "image generation request failed");
        if timed_out {
            format!("Image request timed out after {:?} ({chain})", self.timeout)
        } else {
            chain
        }
    }
}

impl ImageGenerator for OpenAiImages {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, GenerateError> {
        let endpoint = self.endpoint();
        tracing::debug!(%endpoint, model = %request.model, "submitting image generation");
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&request.api_key)
            .timeout(self.timeout)
            .json(&generation_payload(request))
            .send()
            .map_err(|err| GenerateError::Service {
                status: None,
                message: self.transport_message(err),
            })?;
        let status = response.status().as_u16();
        let body = response.text().map_err(|err| GenerateError::Service {
            status: Some(status),
            message: self.transport_message(err),
        })?;
        if !(200..300).contains(&status) {
            let message = service_error_message(status, &body);
            tracing::warn!(status, %message, "image generation rejected");
            return Err(GenerateError::Service {
                status: Some(status),
                message,
            });
        }
        let payload: Value = serde_json::from_str(&body).map_err(|err| GenerateError::Service {
            status: Some(status),
            message: format!("image service returned invalid JSON: {err}"),
        })?;
        let result = parse_generation_response(&payload);
        if result.is_err() {
            tracing::warn!(status, "no image found in response");
        }
        result
    }
}

fn generation_payload(request: &GenerationRequest) -> Value {
    json!({
        "model": request.model,
        "prompt": request.prompt,
        "n": 1,
        "response_format": request.response_format.as_str(),
    })
}

/// Pulls the first image out of an `images/generations` response body.
pub fn parse_generation_response(payload: &Value) -> Result<GenerationResult, GenerateError> {
    let first = payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_object)
        .ok_or(GenerateError::NoImage)?;

    let revised_prompt = first
        .get("revised_prompt")
        .and_then(Value::as_str)
        .map(str::to_string);
    let non_empty = |key: &str| {
        first
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let payload = if let Some(b64) = non_empty("b64_json") {
        ImagePayload::embedded_base64("image/png", b64)
    } else if let Some(url) = non_empty("url") {
        ImagePayload::remote(url)
    } else {
        return Err(GenerateError::NoImage);
    };
    Ok(GenerationResult {
        payload,
        revised_prompt,
    })
}

/// The service's own error text (`error.message`), or the raw body when it is not JSON.
pub fn service_error_message(status: u16, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .pointer("/error/message")
            .or_else(|| value.get("message"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
    });
    if let Some(message) = from_json {
        return message;
    }
    let body = body.trim();
    if body.is_empty() {
        return format!("Request failed with status code {status}");
    }
    truncate_text(body, 512)
}

/// Offline generator: a solid swatch whose colour is derived from the prompt.
pub struct DryrunGenerator;

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, GenerateError> {
        let bytes = render_swatch(&request.prompt, 256).map_err(|err| GenerateError::Service {
            status: None,
            message: format!("dry-run render failed: {err:#}"),
        })?;
        Ok(GenerationResult {
            payload: ImagePayload::embedded("image/png", &bytes),
            revised_prompt: Some(format!("{} (dry run)", request.prompt.trim())),
        })
    }
}

fn render_swatch(prompt: &str, size: u32) -> anyhow::Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt);
    let image = RgbImage::from_pixel(size, size, Rgb([r, g, b]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .context("failed encoding dry-run PNG")?;
    Ok(out.into_inner())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    // FNV-1a, so the same prompt always yields the same swatch.
    let mut hash: u32 = 0x811c_9dc5;
    for byte in prompt.trim().bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let [r, g, b, _] = hash.to_le_bytes();
    (r, g, b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl ImageBytes {
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("image/jpeg") | Some("image/jpg") => "jpg",
            Some("image/webp") => "webp",
            Some("image/gif") => "gif",
            _ => "png",
        }
    }
}

/// Bytes behind a payload: embedded data is decoded, remote locators are fetched.
pub fn resolve_payload_bytes(
    http: &HttpClient,
    payload: &ImagePayload,
) -> anyhow::Result<ImageBytes> {
    match payload {
        ImagePayload::Embedded { .. } => {
            let Some((mime, body)) = payload.data_url_parts() else {
                bail!("embedded image is not a base64 data URL");
            };
            let bytes = BASE64
                .decode(body.as_bytes())
                .context("embedded image base64 decode failed")?;
            Ok(ImageBytes {
                bytes,
                mime_type: Some(mime.to_string()),
            })
        }
        ImagePayload::Remote { url } => {
            let response = http
                .get(url)
                .send()
                .with_context(|| format!("failed downloading image ({})", truncate_text(url, 96)))?;
            if !response.status().is_success() {
                let code = response.status().as_u16();
                let body = response.text().unwrap_or_default();
                bail!(
                    "image download failed ({code}): {}",
                    service_error_message(code, &body)
                );
            }
            let mime_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let bytes = response
                .bytes()
                .context("failed reading image bytes")?
                .to_vec();
            Ok(ImageBytes { bytes, mime_type })
        }
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
