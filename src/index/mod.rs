//! Index data model.
//!
//! Every catalog directory holds an `index.json` mapping image file names to
//! [`ImageRecord`]s. The archive root holds a second `index.json`, the
//! [`GlobalIndex`], summarizing each top-level catalog. Both files are
//! rewritten in full on every save and serialized with sorted keys so output
//! is stable across runs.

pub mod markdown;

use std::collections::{BTreeMap, BTreeSet};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// File name of the per-directory and global JSON index.
pub const INDEX_JSON: &str = "index.json";

/// File name of the Markdown views.
pub const INDEX_MD: &str = "index.md";

/// `short_name` written for records whose analysis failed.
pub const ERROR_SHORT_NAME: &str = "error_processing";

/// `description` written for records whose analysis failed.
pub const ERROR_DESCRIPTION: &str = "Error processing file (retry will be attempted)";

/// `vl_model` written for records whose analysis failed.
pub const UNKNOWN_MODEL: &str = "unknown";

/// True for file names reserved for index output.
pub fn is_reserved_name(name: &str) -> bool {
    name == INDEX_JSON || name == INDEX_MD
}

/// Current time truncated to whole seconds, matching the on-disk precision.
pub fn now() -> Timestamp {
    let now = Timestamp::now();
    Timestamp::from_second(now.as_second()).unwrap_or(now)
}

/// Result of the most recent analysis attempt for an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Analyzed {
        short_name: String,
        description: String,
    },
    /// The attempt failed; the image is retried on the next pass.
    Failed { reason: String },
}

/// One entry of a directory index.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "RawRecord")]
pub struct ImageRecord {
    pub original_name: String,
    pub model_id: String,
    pub updated_at: Option<Timestamp>,
    pub outcome: RecordOutcome,
    /// Keys this version does not know about, written back unchanged.
    pub extra: Map<String, Value>,
}

impl ImageRecord {
    pub fn analyzed(
        original_name: impl Into<String>,
        short_name: impl Into<String>,
        description: impl Into<String>,
        model_id: impl Into<String>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            original_name: original_name.into(),
            model_id: model_id.into(),
            updated_at: Some(updated_at),
            outcome: RecordOutcome::Analyzed {
                short_name: short_name.into(),
                description: description.into(),
            },
            extra: Map::new(),
        }
    }

    pub fn failed(
        original_name: impl Into<String>,
        reason: impl Into<String>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            original_name: original_name.into(),
            model_id: UNKNOWN_MODEL.to_string(),
            updated_at: Some(updated_at),
            outcome: RecordOutcome::Failed {
                reason: reason.into(),
            },
            extra: Map::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, RecordOutcome::Failed { .. })
    }

    pub fn short_name(&self) -> &str {
        match &self.outcome {
            RecordOutcome::Analyzed { short_name, .. } => short_name,
            RecordOutcome::Failed { .. } => ERROR_SHORT_NAME,
        }
    }

    pub fn description(&self) -> &str {
        match &self.outcome {
            RecordOutcome::Analyzed { description, .. } => description,
            RecordOutcome::Failed { .. } => ERROR_DESCRIPTION,
        }
    }
}

/// Flat on-disk shape of an [`ImageRecord`].
#[derive(Serialize)]
struct RawRecord {
    short_name: String,
    description: String,
    original_name: String,
    vl_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    update_date: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl ImageRecord {
    /// Build a record from one JSON object of an index file.
    ///
    /// Each known field is read on its own: a missing, `null` or mistyped
    /// value falls back to its default instead of rejecting the record.
    /// Unparseable dates become `None`. Unknown keys land in `extra`.
    pub fn from_object(mut fields: Map<String, Value>) -> Self {
        let short_name = take_string(&mut fields, "short_name").unwrap_or_default();
        let description = take_string(&mut fields, "description").unwrap_or_default();
        let original_name = take_string(&mut fields, "original_name").unwrap_or_default();
        let model_id = take_string(&mut fields, "vl_model").unwrap_or_default();
        let updated_at =
            take_string(&mut fields, "update_date").and_then(|s| s.parse::<Timestamp>().ok());
        let error = take_string(&mut fields, "error");

        // The sentinel is the only failure marker older index files carry.
        let outcome = if short_name == ERROR_SHORT_NAME {
            RecordOutcome::Failed {
                reason: error.unwrap_or(description),
            }
        } else {
            RecordOutcome::Analyzed {
                short_name,
                description,
            }
        };

        ImageRecord {
            original_name,
            model_id,
            updated_at,
            outcome,
            extra: fields,
        }
    }
}

/// Remove `key` from `fields`, keeping it only if it is a string.
fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::String(s) => Some(s),
        _ => None,
    }
}

impl From<ImageRecord> for RawRecord {
    fn from(record: ImageRecord) -> Self {
        let (short_name, description, error) = match record.outcome {
            RecordOutcome::Analyzed {
                short_name,
                description,
            } => (short_name, description, None),
            RecordOutcome::Failed { reason } => (
                ERROR_SHORT_NAME.to_string(),
                ERROR_DESCRIPTION.to_string(),
                Some(reason),
            ),
        };

        RawRecord {
            short_name,
            description,
            original_name: record.original_name,
            vl_model: record.model_id,
            update_date: record.updated_at,
            error,
            extra: record.extra,
        }
    }
}

/// Records of one directory, keyed by image file name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DirectoryIndex {
    records: BTreeMap<String, ImageRecord>,
}

impl DirectoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an index file.
    ///
    /// Only text that is not a JSON object fails. Records are judged one by
    /// one: an entry that is not an object is left out, so its image is
    /// analyzed again.
    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        let entries: Map<String, Value> = serde_json::from_str(content)?;
        let mut index = Self::new();
        for (filename, entry) in entries {
            match entry {
                Value::Object(fields) => index.insert(filename, ImageRecord::from_object(fields)),
                other => debug!(file = %filename, "ignoring malformed record: {other}"),
            }
        }
        Ok(index)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, filename: &str) -> Option<&ImageRecord> {
        self.records.get(filename)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.records.contains_key(filename)
    }

    pub fn insert(&mut self, filename: impl Into<String>, record: ImageRecord) {
        self.records.insert(filename.into(), record);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ImageRecord)> {
        self.records.iter()
    }

    /// Drop every record whose file is not in `present`.
    ///
    /// Returns the removed file names.
    pub fn retain_present(&mut self, present: &BTreeSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .records
            .keys()
            .filter(|name| !present.contains(*name))
            .cloned()
            .collect();
        for name in &stale {
            self.records.remove(name);
        }
        stale
    }

    /// An image needs analysis when it has no record or its last attempt failed.
    pub fn needs_processing(&self, filename: &str) -> bool {
        self.records.get(filename).is_none_or(ImageRecord::is_failed)
    }

    /// Most recent `updated_at` across all records.
    pub fn last_update(&self) -> Option<Timestamp> {
        self.records.values().filter_map(|r| r.updated_at).max()
    }

    /// Summary of this index under `name`; `fallback` is used when no record carries a date.
    pub fn summary(&self, name: impl Into<String>, fallback: Timestamp) -> CatalogSummary {
        CatalogSummary {
            name: name.into(),
            image_count: self.len(),
            last_update: self.last_update().unwrap_or(fallback),
        }
    }
}

/// Image count and freshness of a catalog or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSummary {
    /// Filled from the map key; not part of the JSON value.
    #[serde(skip)]
    pub name: String,
    pub image_count: usize,
    pub last_update: Timestamp,
}

impl CatalogSummary {
    /// Fold another summary into this one (counts add, newest date wins).
    pub fn absorb(&mut self, other: &CatalogSummary) {
        self.image_count += other.image_count;
        if other.last_update > self.last_update {
            self.last_update = other.last_update;
        }
    }
}

/// Root-level aggregate: catalog name -> summary.
///
/// Always derivable from the directory indexes beneath the archive root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalIndex {
    catalogs: BTreeMap<String, CatalogSummary>,
}

impl GlobalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        let mut index: GlobalIndex = serde_json::from_str(content)?;
        for (name, summary) in &mut index.catalogs {
            summary.name = name.clone();
        }
        Ok(index)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Add `summary` under its name, merging with an existing entry.
    pub fn merge(&mut self, summary: CatalogSummary) {
        match self.catalogs.get_mut(&summary.name) {
            Some(existing) => existing.absorb(&summary),
            None => {
                self.catalogs.insert(summary.name.clone(), summary);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&CatalogSummary> {
        self.catalogs.get(name)
    }

    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogSummary> {
        self.catalogs.values()
    }
}
