//! Gallery view-model, persistence and image generation for the easel client.

pub mod config;
pub mod generator;
pub mod state;
pub mod view;

pub use config::EaselConfig;
pub use generator::{
    default_generator_registry, resolve_payload_bytes, DryrunGenerator, GenerateError,
    GenerationRequest, GenerationResult, GeneratorRegistry, ImageBytes, ImageGenerator,
    OpenAiImages, ResponseFormat, DEFAULT_API_BASE, DEFAULT_MODEL,
};
pub use state::{GallerySource, LoadedGallery, LocalState};
pub use view::{GalleryView, PendingSubmission, SubmitOutcome, SubmitState};
