use std::collections::{BTreeSet, HashSet};

use serde::Deserialize;
use serde_json::Value;

use super::record::GeneratedImage;

/// A stored gallery value, classified by schema version before any migration runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredGallery {
    /// Array of complete records with unique ids.
    Current(Vec<GeneratedImage>),
    /// Array of objects carrying a payload but not every current field.
    LegacyObjectList(Vec<LegacyRecord>),
    /// Array of bare image locators.
    LegacyStringList(Vec<String>),
    Corrupt { raw: String, reason: String },
}

/// A loosely shaped object row from an older writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub image_data: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub original_prompt: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub revised_prompt: Option<String>,
}

impl LegacyRecord {
    fn has_payload(&self) -> bool {
        self.image_url.is_some() || self.image_data.is_some()
    }
}

impl StoredGallery {
    pub fn schema_name(&self) -> &'static str {
        match self {
            Self::Current(_) => "current",
            Self::LegacyObjectList(_) => "legacy_object_list",
            Self::LegacyStringList(_) => "legacy_string_list",
            Self::Corrupt { .. } => "corrupt",
        }
    }
}

/// Classifies a raw stored value, trying the newest schema first.
pub fn decode_gallery(raw: &str) -> StoredGallery {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => return corrupt(raw, format!("invalid JSON: {err}")),
    };
    let Some(rows) = parsed.as_array() else {
        return corrupt(raw, format!("expected an array, found {}", json_kind(&parsed)));
    };

    if let Some(images) = decode_current(rows) {
        return StoredGallery::Current(images);
    }
    if let Some(records) = decode_legacy_objects(rows) {
        return StoredGallery::LegacyObjectList(records);
    }
    if let Some(urls) = decode_legacy_strings(rows) {
        return StoredGallery::LegacyStringList(urls);
    }

    let kinds = rows
        .iter()
        .map(json_kind)
        .collect::<BTreeSet<&str>>()
        .into_iter()
        .collect::<Vec<&str>>();
    if kinds == ["object"] {
        return corrupt(raw, "objects without an image payload".to_string());
    }
    corrupt(raw, format!("unrecognized element kinds: {}", kinds.join(", ")))
}

fn decode_current(rows: &[Value]) -> Option<Vec<GeneratedImage>> {
    let mut images = Vec::with_capacity(rows.len());
    let mut seen = HashSet::new();
    for row in rows {
        let image = serde_json::from_value::<GeneratedImage>(row.clone()).ok()?;
        if !seen.insert(image.id.clone()) {
            return None;
        }
        images.push(image);
    }
    Some(images)
}

fn decode_legacy_objects(rows: &[Value]) -> Option<Vec<LegacyRecord>> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        if !row.is_object() {
            return None;
        }
        let record = serde_json::from_value::<LegacyRecord>(row.clone()).ok()?;
        if !record.has_payload() {
            return None;
        }
        records.push(record);
    }
    Some(records)
}

fn decode_legacy_strings(rows: &[Value]) -> Option<Vec<String>> {
    rows.iter()
        .map(|row| row.as_str().map(str::to_string))
        .collect()
}

fn corrupt(raw: &str, reason: String) -> StoredGallery {
    StoredGallery::Corrupt {
        raw: raw.to_string(),
        reason,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Treats non-string and blank values as missing instead of failing the whole row.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .map(str::to_string)
        .filter(|text| !text.trim().is_empty()))
}
