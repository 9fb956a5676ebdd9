mod defaults;
mod migrate;
mod notice;
mod record;
mod schema;

pub use defaults::{
    example_images, LEGACY_ORIGINAL_PROMPT_PLACEHOLDER, LEGACY_REVISED_PROMPT_PLACEHOLDER,
};
pub use migrate::{first_run, migrate, Migration};
pub use notice::{Notice, NO_IMAGE_FOUND_MESSAGE};
pub use record::{new_record_id, GeneratedImage, ImagePayload, RecordError};
pub use schema::{decode_gallery, LegacyRecord, StoredGallery};

/// Storage key holding the serialized gallery.
pub const GALLERY_KEY: &str = "generated-images";
/// Storage key holding the plaintext API credential.
pub const API_KEY_KEY: &str = "openai-api-key";
/// Prefix of the timestamped slots that preserve unreadable gallery values.
pub const RECOVERY_KEY_PREFIX: &str = "generated-images-recovery-";

pub fn recovery_key(unix_millis: i64) -> String {
    format!("{RECOVERY_KEY_PREFIX}{unix_millis}")
}
