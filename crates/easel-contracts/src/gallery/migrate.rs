use std::collections::HashSet;

use super::defaults::{
    example_images, LEGACY_ORIGINAL_PROMPT_PLACEHOLDER, LEGACY_REVISED_PROMPT_PLACEHOLDER,
};
use super::notice::Notice;
use super::record::{GeneratedImage, ImagePayload};
use super::schema::{LegacyRecord, StoredGallery};

/// Result of bringing a stored value (or its absence) up to the current schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub images: Vec<GeneratedImage>,
    pub notice: Option<Notice>,
    /// Raw value that must be copied to a recovery slot before `images` is written back.
    pub recovery_raw: Option<String>,
    /// Whether `images` differs from what is stored and should be persisted.
    pub rewrite: bool,
}

/// First run: nothing stored yet.
pub fn first_run(new_id: impl FnMut() -> String) -> Migration {
    Migration {
        images: example_images(new_id),
        notice: Some(Notice::FirstRun),
        recovery_raw: None,
        rewrite: true,
    }
}

pub fn migrate(stored: StoredGallery, mut new_id: impl FnMut() -> String) -> Migration {
    match stored {
        StoredGallery::Current(images) => Migration {
            images,
            notice: None,
            recovery_raw: None,
            rewrite: false,
        },
        StoredGallery::LegacyStringList(urls) => {
            let count = urls.len();
            let mut images = urls
                .into_iter()
                .map(|url| GeneratedImage {
                    id: new_id(),
                    payload: ImagePayload::Remote { url },
                    original_prompt: LEGACY_ORIGINAL_PROMPT_PLACEHOLDER.to_string(),
                    revised_prompt: LEGACY_REVISED_PROMPT_PLACEHOLDER.to_string(),
                })
                .collect::<Vec<GeneratedImage>>();
            images.extend(example_images(&mut new_id));
            Migration {
                images,
                notice: Some(Notice::MigratedLegacyUrls { count }),
                recovery_raw: None,
                rewrite: true,
            }
        }
        StoredGallery::LegacyObjectList(rows) => {
            let count = rows.len();
            Migration {
                images: repair_legacy_rows(rows, new_id),
                notice: Some(Notice::RepairedLegacyRecords { count }),
                recovery_raw: None,
                rewrite: true,
            }
        }
        StoredGallery::Corrupt { raw, .. } => Migration {
            images: example_images(new_id),
            notice: Some(Notice::Corrupted { recovery_key: None }),
            recovery_raw: Some(raw),
            rewrite: true,
        },
    }
}

fn repair_legacy_rows(
    rows: Vec<LegacyRecord>,
    mut new_id: impl FnMut() -> String,
) -> Vec<GeneratedImage> {
    let mut seen = HashSet::new();
    let mut images = Vec::with_capacity(rows.len());
    for row in rows {
        // imageData wins over a likely-expired locator.
        let payload = match (row.image_data, row.image_url) {
            (Some(data), _) => ImagePayload::Embedded { data },
            (None, Some(url)) => ImagePayload::Remote { url },
            (None, None) => continue,
        };
        let id = match row.id {
            Some(id) if !seen.contains(&id) => id,
            _ => new_id(),
        };
        seen.insert(id.clone());
        images.push(GeneratedImage {
            id,
            payload,
            original_prompt: row
                .original_prompt
                .unwrap_or_else(|| LEGACY_ORIGINAL_PROMPT_PLACEHOLDER.to_string()),
            revised_prompt: row
                .revised_prompt
                .unwrap_or_else(|| LEGACY_REVISED_PROMPT_PLACEHOLDER.to_string()),
        });
    }
    images
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{first_run, migrate};
    use crate::gallery::defaults::{
        LEGACY_ORIGINAL_PROMPT_PLACEHOLDER, LEGACY_REVISED_PROMPT_PLACEHOLDER,
    };
    use crate::gallery::{
        decode_gallery, new_record_id, ImagePayload, LegacyRecord, Notice, StoredGallery,
    };

    fn counter() -> impl FnMut() -> String {
        let mut next = 0;
        move || {
            next += 1;
            format!("id-{next}")
        }
    }

    #[test]
    fn first_run_seeds_examples_with_a_welcome() {
        let migration = first_run(new_record_id);
        assert_eq!(migration.images.len(), 3);
        assert_eq!(migration.notice, Some(Notice::FirstRun));
        assert!(migration.rewrite);
    }

    #[test]
    fn current_collection_loads_as_is() {
        let raw = r#"[{"id":"a","imageUrl":"https://x.test/a","originalPrompt":"p","revisedPrompt":"r"}]"#;
        let migration = migrate(decode_gallery(raw), counter());
        assert_eq!(migration.images.len(), 1);
        assert_eq!(migration.images[0].id, "a");
        assert_eq!(migration.notice, None);
        assert!(!migration.rewrite);
    }

    #[test]
    fn legacy_urls_are_wrapped_and_followed_by_examples() {
        let stored = StoredGallery::LegacyStringList(vec![
            "https://x.test/a".to_string(),
            "https://x.test/b".to_string(),
        ]);
        let migration = migrate(stored, counter());

        assert_eq!(migration.images.len(), 5);
        assert_eq!(
            migration.images[0].payload,
            ImagePayload::remote("https://x.test/a")
        );
        assert_eq!(
            migration.images[1].payload,
            ImagePayload::remote("https://x.test/b")
        );
        for image in &migration.images[..2] {
            assert_eq!(image.original_prompt, LEGACY_ORIGINAL_PROMPT_PLACEHOLDER);
            assert_eq!(image.revised_prompt, LEGACY_REVISED_PROMPT_PLACEHOLDER);
        }
        let ids: HashSet<&str> = migration.images.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids.len(), 5);
        assert_eq!(
            migration.notice,
            Some(Notice::MigratedLegacyUrls { count: 2 })
        );
        assert!(migration.rewrite);
        assert_eq!(migration.recovery_raw, None);
    }

    #[test]
    fn legacy_objects_get_ids_and_placeholders() {
        let rows = vec![
            LegacyRecord {
                id: Some("keep".to_string()),
                image_url: Some("https://x.test/a".to_string()),
                original_prompt: Some("boat".to_string()),
                ..LegacyRecord::default()
            },
            LegacyRecord {
                id: Some("keep".to_string()),
                image_url: Some("https://x.test/b".to_string()),
                image_data: Some("data:image/png;base64,AA==".to_string()),
                ..LegacyRecord::default()
            },
        ];
        let migration = migrate(StoredGallery::LegacyObjectList(rows), counter());

        assert_eq!(migration.images.len(), 2);
        assert_eq!(migration.images[0].id, "keep");
        assert_eq!(migration.images[0].original_prompt, "boat");
        assert_eq!(
            migration.images[0].revised_prompt,
            LEGACY_REVISED_PROMPT_PLACEHOLDER
        );
        assert_eq!(migration.images[1].id, "id-1");
        assert_eq!(migration.images[1].payload.kind(), "data");
        assert_eq!(
            migration.notice,
            Some(Notice::RepairedLegacyRecords { count: 2 })
        );
    }

    #[test]
    fn corrupt_value_falls_back_to_examples_and_keeps_raw() {
        let migration = migrate(decode_gallery("{oops"), counter());
        assert_eq!(migration.images.len(), 3);
        assert_eq!(migration.recovery_raw.as_deref(), Some("{oops"));
        assert_eq!(
            migration.notice,
            Some(Notice::Corrupted { recovery_key: None })
        );
        assert!(migration.rewrite);
    }
}
