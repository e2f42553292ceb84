//! Core domain model for AquaSense analysis records and projects.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "aqua-core";

/// Separator used when several detected species are folded into one label.
pub const SPECIES_SEPARATOR: &str = ", ";

/// Pixel-space box returned by the detection model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub species: String,
    #[serde(alias = "confidence")]
    pub probability: f64,
    #[serde(rename = "boundingBox", alias = "bbox")]
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisMode {
    #[serde(rename = "single")]
    SingleLabel,
    #[serde(rename = "multi")]
    MultiDetection,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::SingleLabel => "single",
            AnalysisMode::MultiDetection => "multi",
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMode(pub String);

impl fmt::Display for UnknownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown analysis mode `{}`", self.0)
    }
}

impl std::error::Error for UnknownMode {}

impl FromStr for AnalysisMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single-label" | "predict" => Ok(AnalysisMode::SingleLabel),
            "multi" | "multi-detection" | "detect" => Ok(AnalysisMode::MultiDetection),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

/// Mode-specific outcome of one analysis call.
///
/// Only single-label results carry a scalar confidence, and the classifier
/// may omit it; detection results carry per-box probabilities instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum Analysis {
    #[serde(rename = "single")]
    SingleLabel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },
    #[serde(rename = "multi")]
    MultiDetection {
        detections: Vec<Detection>,
        #[serde(
            rename = "annotatedImage",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        annotated_image: Option<String>,
    },
}

impl Analysis {
    pub fn mode(&self) -> AnalysisMode {
        match self {
            Analysis::SingleLabel { .. } => AnalysisMode::SingleLabel,
            Analysis::MultiDetection { .. } => AnalysisMode::MultiDetection,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            Analysis::SingleLabel { confidence } => *confidence,
            Analysis::MultiDetection { .. } => None,
        }
    }

    pub fn detections(&self) -> &[Detection] {
        match self {
            Analysis::SingleLabel { .. } => &[],
            Analysis::MultiDetection { detections, .. } => detections,
        }
    }
}

/// Fold detection labels into the single `species` string stored on a record.
pub fn joined_species(detections: &[Detection]) -> String {
    detections
        .iter()
        .map(|d| d.species.as_str())
        .collect::<Vec<_>>()
        .join(SPECIES_SEPARATOR)
}

/// Canonical analysis record, as handed out after reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub id: String,
    #[serde(rename = "userId")]
    pub owner_user_id: String,
    /// Empty when the record is not assigned to a project.
    pub project_id: String,
    pub image_path: String,
    pub image_url: String,
    pub species: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub analysis: Analysis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl AnalysisRecord {
    pub fn confidence(&self) -> Option<f64> {
        self.analysis.confidence()
    }

    pub fn mode(&self) -> AnalysisMode {
        self.analysis.mode()
    }

    /// False for records whose image could not be recovered.
    pub fn has_image(&self) -> bool {
        !self.image_url.is_empty()
    }

    /// Stored-document view of this record, using current field names only.
    pub fn to_raw(&self) -> RawAnalysisRecord {
        let (confidence, detections, annotated_image) = match &self.analysis {
            Analysis::SingleLabel { confidence } => (*confidence, None, None),
            Analysis::MultiDetection {
                detections,
                annotated_image,
            } => (None, Some(detections.clone()), annotated_image.clone()),
        };
        RawAnalysisRecord {
            id: self.id.clone(),
            user_id: Some(self.owner_user_id.clone()),
            project_id: Some(self.project_id.clone()),
            image_url: Some(self.image_url.clone()),
            legacy_url: None,
            image_path: Some(self.image_path.clone()),
            legacy_path: None,
            species: Some(self.species.clone()),
            confidence,
            detections,
            annotated_image,
            mode: Some(self.mode().as_str().to_string()),
            timestamp: Some(self.timestamp),
            notes: self.notes.clone(),
            location: self.location.clone(),
        }
    }
}

/// Analysis document as persisted, before any repair.
///
/// Older documents used `url` / `storagePath` for the image fields; those are
/// read only when the current names are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAnalysisRecord {
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "projectId", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(rename = "url", default, skip_serializing_if = "Option::is_none")]
    pub legacy_url: Option<String>,
    #[serde(rename = "imagePath", default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(rename = "storagePath", default, skip_serializing_if = "Option::is_none")]
    pub legacy_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<Detection>>,
    #[serde(rename = "annotatedImage", default, skip_serializing_if = "Option::is_none")]
    pub annotated_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl RawAnalysisRecord {
    /// Attach the store-level identity; `created_at` backfills a missing timestamp.
    pub fn with_identity(mut self, id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        self.id = id.into();
        self.timestamp.get_or_insert(created_at);
        self
    }

    pub fn stored_url(&self) -> &str {
        self.image_url
            .as_deref()
            .or(self.legacy_url.as_deref())
            .unwrap_or_default()
    }

    pub fn stored_path(&self) -> &str {
        self.image_path
            .as_deref()
            .or(self.legacy_path.as_deref())
            .unwrap_or_default()
    }

    /// Resolve the analysis mode.
    ///
    /// An explicit `mode` wins; otherwise non-empty detections mean
    /// multi-detection. A non-finite stored confidence is dropped.
    pub fn analysis(&self) -> Analysis {
        let detections = self.detections.clone().unwrap_or_default();
        let mode = self
            .mode
            .as_deref()
            .and_then(|m| m.parse::<AnalysisMode>().ok())
            .unwrap_or(if detections.is_empty() {
                AnalysisMode::SingleLabel
            } else {
                AnalysisMode::MultiDetection
            });

        match mode {
            AnalysisMode::SingleLabel => Analysis::SingleLabel {
                confidence: self.confidence.filter(|c| c.is_finite()),
            },
            AnalysisMode::MultiDetection => Analysis::MultiDetection {
                detections,
                annotated_image: self.annotated_image.clone(),
            },
        }
    }

    /// Build the canonical record with the given (already vetted) image fields.
    pub fn into_record(self, image_url: String, image_path: String) -> AnalysisRecord {
        let analysis = self.analysis();
        let species = self
            .species
            .unwrap_or_else(|| joined_species(analysis.detections()));
        AnalysisRecord {
            id: self.id,
            owner_user_id: self.user_id.unwrap_or_default(),
            project_id: self.project_id.unwrap_or_default(),
            image_path,
            image_url,
            species,
            timestamp: self.timestamp.unwrap_or_default(),
            analysis,
            notes: self.notes,
            location: self.location,
        }
    }
}

/// Research project grouping analyses; access is owner plus listed members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(skip)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "userId")]
    pub owner_user_id: String,
    /// Never contains the owner.
    #[serde(default)]
    pub members: BTreeSet<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        owner_user_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: description.into(),
            owner_user_id: owner_user_id.into(),
            members: BTreeSet::new(),
            created_at,
        }
    }

    /// Re-establish the owner/member invariant on data read from storage.
    pub fn normalized(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self.members.remove(&self.owner_user_id);
        self
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_user_id == user_id
    }

    pub fn can_access(&self, user_id: &str) -> bool {
        self.is_owner(user_id) || self.members.contains(user_id)
    }

    /// Returns false when nothing changed (owner or existing member).
    pub fn add_member(&mut self, user_id: &str) -> bool {
        if self.is_owner(user_id) {
            return false;
        }
        self.members.insert(user_id.to_string())
    }

    pub fn remove_member(&mut self, user_id: &str) -> bool {
        self.members.remove(user_id)
    }

    /// Members present in `after` that were not in `before`.
    pub fn newly_added_members<'a>(before: &Project, after: &'a Project) -> Vec<&'a str> {
        after
            .members
            .iter()
            .filter(|m| !before.members.contains(*m))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "uid")]
    pub id: String,
    pub email: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 16, 10, 30, 0).single().unwrap()
    }

    #[test]
    fn legacy_image_fields_are_fallbacks_only() {
        let raw: RawAnalysisRecord = serde_json::from_value(serde_json::json!({
            "url": "https://legacy/u",
            "storagePath": "uploads/u1/1-a.png",
        }))
        .unwrap();
        assert_eq!(raw.stored_url(), "https://legacy/u");
        assert_eq!(raw.stored_path(), "uploads/u1/1-a.png");

        let raw: RawAnalysisRecord = serde_json::from_value(serde_json::json!({
            "imageUrl": "",
            "url": "https://legacy/u",
        }))
        .unwrap();
        assert_eq!(raw.stored_url(), "");
    }

    #[test]
    fn mode_is_inferred_from_detections() {
        let raw: RawAnalysisRecord = serde_json::from_value(serde_json::json!({
            "species": "Crab, Whelk",
            "detections": [
                {"species": "Crab", "confidence": 0.8, "bbox": {"x1": 0.0, "y1": 0.0, "x2": 5.0, "y2": 5.0}},
                {"species": "Whelk", "probability": 0.6, "boundingBox": {"x1": 1.0, "y1": 1.0, "x2": 2.0, "y2": 2.0}}
            ]
        }))
        .unwrap();
        let analysis = raw.analysis();
        assert_eq!(analysis.mode(), AnalysisMode::MultiDetection);
        assert_eq!(analysis.confidence(), None);
        assert_eq!(analysis.detections().len(), 2);
        assert_eq!(joined_species(analysis.detections()), "Crab, Whelk");
    }

    #[test]
    fn single_label_without_confidence_keeps_its_mode() {
        let raw = RawAnalysisRecord {
            species: Some("Eel".into()),
            mode: Some("single".into()),
            ..Default::default()
        };
        assert_eq!(raw.analysis(), Analysis::SingleLabel { confidence: None });
        assert_eq!(raw.analysis().confidence(), None);

        let record = raw
            .with_identity("a1", ts())
            .into_record(String::new(), String::new());
        assert_eq!(record.mode(), AnalysisMode::SingleLabel);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["mode"], "single");
        assert!(value.get("confidence").is_none());

        let raw = RawAnalysisRecord {
            mode: Some("single".into()),
            confidence: Some(f64::NAN),
            ..Default::default()
        };
        assert_eq!(raw.analysis(), Analysis::SingleLabel { confidence: None });

        let raw = RawAnalysisRecord {
            species: Some("Eel".into()),
            confidence: Some(0.42),
            ..Default::default()
        };
        assert_eq!(raw.analysis(), Analysis::SingleLabel { confidence: Some(0.42) });
    }

    #[test]
    fn record_round_trips_through_raw_view() {
        let raw = RawAnalysisRecord {
            user_id: Some("u1".into()),
            project_id: Some("p1".into()),
            species: Some("Scallop".into()),
            confidence: Some(0.9),
            notes: Some("reef 3".into()),
            ..Default::default()
        }
        .with_identity("a1", ts());
        let record = raw.into_record("https://x/y".into(), "uploads/u1/y".into());
        let again = record
            .to_raw()
            .into_record(record.image_url.clone(), record.image_path.clone());
        assert_eq!(record, again);
        assert_eq!(record.timestamp, ts());
    }

    #[test]
    fn canonical_record_serializes_mode_tag_inline() {
        let record = RawAnalysisRecord {
            species: Some("Crab".into()),
            confidence: Some(0.5),
            ..Default::default()
        }
        .with_identity("a1", ts())
        .into_record(String::new(), String::new());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["mode"], "single");
        assert_eq!(value["confidence"], 0.5);
        assert_eq!(value["imageUrl"], "");
    }

    #[test]
    fn owner_never_becomes_member() {
        let mut project = Project::new("Reef survey", "", "owner", ts());
        assert!(!project.add_member("owner"));
        assert!(project.add_member("m1"));
        assert!(!project.add_member("m1"));
        assert!(project.can_access("owner"));
        assert!(project.can_access("m1"));
        assert!(!project.can_access("stranger"));

        let mut stored = project.clone();
        stored.members.insert("owner".into());
        let stored = stored.normalized("p1");
        assert!(!stored.members.contains("owner"));
        assert_eq!(stored.id, "p1");
    }

    #[test]
    fn newly_added_members_is_a_set_difference() {
        let mut before = Project::new("P", "", "owner", ts());
        before.add_member("a");
        let mut after = before.clone();
        after.add_member("b");
        after.add_member("c");
        after.remove_member("a");
        assert_eq!(Project::newly_added_members(&before, &after), vec!["b", "c"]);

        // the borrow of `before` may end before the result is used
        let added = {
            let snapshot = before.clone();
            Project::newly_added_members(&snapshot, &after)
        };
        assert_eq!(added, vec!["b", "c"]);
    }
}
