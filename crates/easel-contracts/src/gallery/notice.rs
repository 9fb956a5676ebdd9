use std::fmt;

pub const NO_IMAGE_FOUND_MESSAGE: &str =
    "No image found in response. This is probably not your fault.";

/// The single user-facing message slot of the gallery view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    FirstRun,
    MigratedLegacyUrls { count: usize },
    RepairedLegacyRecords { count: usize },
    Corrupted { recovery_key: Option<String> },
    StorageWriteFailed { detail: String },
    /// The store itself could not be read; example images are shown but not saved.
    StorageReadFailed { detail: String },
    NoImageFound,
    GenerationFailed { message: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstRun => f.write_str(
                "Welcome! This is your first visit, so some example images have been added to get you \
                 started. Every image you generate is kept here on this machine for you to come back to.",
            ),
            Self::MigratedLegacyUrls { count } => write!(
                f,
                "{count} stored image(s) were in an old format. They have been converted, but their \
                 prompts were not recorded and are shown as placeholders. Example images were added too.",
            ),
            Self::RepairedLegacyRecords { count } => write!(
                f,
                "{count} stored image(s) were missing details. Placeholders were filled in where needed.",
            ),
            Self::Corrupted { recovery_key } => match recovery_key {
                Some(key) => write!(
                    f,
                    "Your stored images were malformed and have been replaced with the example images. \
                     The old data was kept under the recovery entry '{key}'. Contact the developer for \
                     help recovering it.",
                ),
                None => f.write_str(
                    "Your stored images were malformed and have been replaced with the example images. \
                     The old data could not be copied to a recovery entry and stays in storage only until \
                     the gallery is next saved.",
                ),
            },
            Self::StorageWriteFailed { detail } => {
                write!(f, "The gallery could not be saved ({detail}). Nothing was changed.")
            }
            Self::StorageReadFailed { detail } => write!(
                f,
                "Your saved images could not be read ({detail}). Example images are shown instead; \
                 new images cannot be saved until the storage file is repaired or removed.",
            ),
            Self::NoImageFound => f.write_str(NO_IMAGE_FOUND_MESSAGE),
            Self::GenerationFailed { message } => f.write_str(message),
        }
    }
}
