//! Upload, analyze and record a batch of images.

use std::sync::Arc;

use aqua_core::{AnalysisMode, RawAnalysisRecord};
use aqua_inference::{ImagePayload, InferenceClient, Prediction};
use aqua_storage::{BlobStore, DocumentStore, StoreError, ANALYSES};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{DEFAULT_MAX_BATCH, DEFAULT_MAX_FILE_BYTES};
use crate::projects::ProjectService;
use crate::{PipelineError, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestLimits {
    pub max_file_bytes: usize,
    pub max_batch: usize,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Analyzed {
        filename: String,
        record_id: String,
        species: String,
    },
    Failed {
        filename: String,
        error: String,
    },
}

impl ImageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ImageOutcome::Analyzed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ImageOutcome>,
}

#[derive(Clone)]
pub struct Ingestor {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    inference: Arc<dyn InferenceClient>,
    projects: ProjectService,
    limits: IngestLimits,
    concurrency: usize,
}

impl Ingestor {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        inference: Arc<dyn InferenceClient>,
        projects: ProjectService,
        limits: IngestLimits,
    ) -> Self {
        Self {
            documents,
            blobs,
            inference,
            projects,
            limits,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn limits(&self) -> IngestLimits {
        self.limits
    }

    /// Analyze every image independently; one failure never aborts the
    /// batch. An empty `project_id` records the analyses unassigned.
    pub async fn analyze_batch(
        &self,
        session: &Session,
        project_id: &str,
        mode: AnalysisMode,
        images: Vec<ImagePayload>,
    ) -> Result<BatchReport, PipelineError> {
        if images.is_empty() {
            return Err(PipelineError::InvalidInput("no images supplied".into()));
        }
        if images.len() > self.limits.max_batch {
            return Err(PipelineError::InvalidInput(format!(
                "batch of {} images exceeds the limit of {}",
                images.len(),
                self.limits.max_batch
            )));
        }
        if !project_id.is_empty() {
            self.projects.get(session, project_id).await?;
        }

        let span = info_span!(
            "analyze_batch",
            user_id = session.user_id(),
            project_id,
            %mode,
            images = images.len()
        );
        let results: Vec<ImageOutcome> = stream::iter(images)
            .map(|image| self.analyze_one(session, project_id, mode, image))
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .instrument(span)
            .await;

        let successful = results.iter().filter(|r| r.is_success()).count();
        let report = BatchReport {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        };
        info!(
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "batch analyzed"
        );
        Ok(report)
    }

    async fn analyze_one(
        &self,
        session: &Session,
        project_id: &str,
        mode: AnalysisMode,
        image: ImagePayload,
    ) -> ImageOutcome {
        let filename = image.filename.clone();
        match self.try_analyze(session, project_id, mode, image).await {
            Ok((record_id, species)) => ImageOutcome::Analyzed {
                filename,
                record_id,
                species,
            },
            Err(err) => {
                warn!(filename = %filename, error = %err, "image analysis failed");
                ImageOutcome::Failed {
                    filename,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn try_analyze(
        &self,
        session: &Session,
        project_id: &str,
        mode: AnalysisMode,
        image: ImagePayload,
    ) -> Result<(String, String), PipelineError> {
        self.validate(&image)?;

        let nonce = Uuid::new_v4().simple().to_string();
        let path = upload_path(
            session.user_id(),
            Utc::now().timestamp_millis(),
            &nonce,
            &image.filename,
        );
        self.blobs
            .put(&path, image.bytes.clone(), &image.content_type)
            .await?;
        let image_url = self.blobs.resolve_url(&path).await?;

        let prediction = self.inference.analyze(mode, &image).await?;
        let species = prediction.species_label();

        let mut raw = RawAnalysisRecord {
            user_id: Some(session.user_id().to_string()),
            project_id: Some(project_id.to_string()),
            image_url: Some(image_url),
            image_path: Some(path),
            species: Some(species.clone()),
            mode: Some(prediction.mode().as_str().to_string()),
            ..Default::default()
        };
        match prediction {
            Prediction::Label { confidence, .. } => raw.confidence = confidence,
            Prediction::Detections {
                detections,
                annotated_image,
            } => {
                raw.detections = Some(detections);
                raw.annotated_image = annotated_image;
            }
        }

        let data = serde_json::to_value(&raw).map_err(StoreError::from)?;
        let doc = self.documents.insert(ANALYSES, data).await?;
        Ok((doc.id, species))
    }

    fn validate(&self, image: &ImagePayload) -> Result<(), PipelineError> {
        if image.filename.trim().is_empty() {
            return Err(PipelineError::InvalidInput("file has no name".into()));
        }
        if !image.content_type.starts_with("image/") {
            return Err(PipelineError::InvalidInput(format!(
                "{} is not an image ({})",
                image.filename, image.content_type
            )));
        }
        if image.bytes.is_empty() {
            return Err(PipelineError::InvalidInput(format!("{} is empty", image.filename)));
        }
        if image.bytes.len() > self.limits.max_file_bytes {
            return Err(PipelineError::InvalidInput(format!(
                "{} is {} bytes; the limit is {}",
                image.filename,
                image.bytes.len(),
                self.limits.max_file_bytes
            )));
        }
        Ok(())
    }
}

/// `uploads/{user}/{millis}-{nonce}-{name}`, with path separators in the name
/// flattened. The nonce keeps same-named files in one batch apart.
pub fn upload_path(user_id: &str, millis: i64, nonce: &str, filename: &str) -> String {
    let name: String = filename
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("uploads/{user_id}/{millis}-{nonce}-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{LogMailer, Notifier};
    use aqua_core::{BoundingBox, Detection};
    use aqua_inference::ScriptedInferenceClient;
    use aqua_storage::{MemoryBlobStore, MemoryDocumentStore, PROJECTS};
    use serde_json::json;

    fn png(name: &str) -> ImagePayload {
        ImagePayload {
            filename: name.into(),
            content_type: "image/png".into(),
            bytes: vec![1, 2, 3],
        }
    }

    fn crab_and_whelk() -> Prediction {
        let bbox = BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 1.0,
            y2: 1.0,
        };
        Prediction::Detections {
            detections: vec![
                Detection {
                    species: "Crab".into(),
                    probability: 0.9,
                    bounding_box: bbox,
                },
                Detection {
                    species: "Whelk".into(),
                    probability: 0.6,
                    bounding_box: bbox,
                },
            ],
            annotated_image: None,
        }
    }

    async fn fixture(
        inference: ScriptedInferenceClient,
        limits: IngestLimits,
    ) -> (Arc<MemoryDocumentStore>, Arc<MemoryBlobStore>, Ingestor) {
        let docs = Arc::new(MemoryDocumentStore::recording());
        docs.seed(
            PROJECTS,
            "p1",
            json!({"name": "Reef", "userId": "u1", "createdAt": "2025-01-01T00:00:00Z"}),
        )
        .await;
        let blobs = Arc::new(MemoryBlobStore::new("http://blobs"));
        let projects = ProjectService::new(
            docs.clone(),
            Notifier::new(Arc::new(LogMailer), docs.clone(), "http://app"),
        );
        let ingestor = Ingestor::new(
            docs.clone(),
            blobs.clone(),
            Arc::new(inference),
            projects,
            limits,
        );
        (docs, blobs, ingestor)
    }

    #[test]
    fn upload_paths_are_flat_per_user() {
        assert_eq!(upload_path("u1", 42, "n1", "a.png"), "uploads/u1/42-n1-a.png");
        assert_eq!(
            upload_path("u1", 42, "n1", "../x/b.png"),
            "uploads/u1/42-n1-.._x_b.png"
        );
    }

    #[tokio::test]
    async fn failures_are_isolated_per_image() {
        let inference = ScriptedInferenceClient::new()
            .with("reef.png", crab_and_whelk())
            .with("late.png", crab_and_whelk());
        let (docs, blobs, ingestor) = fixture(inference, IngestLimits::default()).await;
        let session = Session::new("u1").unwrap();

        let notes = ImagePayload {
            filename: "notes.txt".into(),
            content_type: "text/plain".into(),
            bytes: vec![1],
        };
        let report = ingestor
            .analyze_batch(
                &session,
                "p1",
                AnalysisMode::MultiDetection,
                vec![png("reef.png"), notes, png("unknown.png"), png("late.png")],
            )
            .await
            .unwrap();

        assert_eq!(report.total, 4);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 2);
        assert!(matches!(&report.results[1], ImageOutcome::Failed { filename, .. } if filename == "notes.txt"));
        assert!(!report.results[2].is_success());
        assert_eq!(docs.len(ANALYSES).await, 2);

        let ImageOutcome::Analyzed { record_id, species, .. } = &report.results[0] else {
            panic!("first image should succeed");
        };
        assert_eq!(species, "Crab, Whelk");
        let doc = docs.get(ANALYSES, record_id).await.unwrap().unwrap();
        assert_eq!(doc.data["projectId"], "p1");
        assert_eq!(doc.data["mode"], "multi");
        assert_eq!(doc.data["detections"].as_array().unwrap().len(), 2);
        let path = doc.data["imagePath"].as_str().unwrap();
        assert!(path.starts_with("uploads/u1/") && path.ends_with("-reef.png"));
        assert_eq!(doc.data["imageUrl"], format!("http://blobs/{path}"));
        assert!(blobs.get(path).await.is_some());
    }

    #[tokio::test]
    async fn single_label_records_keep_confidence() {
        let inference = ScriptedInferenceClient::new().with(
            "a.png",
            Prediction::Label {
                species: "Scallop".into(),
                confidence: Some(0.87),
            },
        );
        let (docs, _blobs, ingestor) = fixture(inference, IngestLimits::default()).await;
        let report = ingestor
            .analyze_batch(
                &Session::new("u1").unwrap(),
                "",
                AnalysisMode::SingleLabel,
                vec![png("a.png")],
            )
            .await
            .unwrap();
        let ImageOutcome::Analyzed { record_id, .. } = &report.results[0] else {
            panic!("expected success");
        };
        let doc = docs.get(ANALYSES, record_id).await.unwrap().unwrap();
        assert_eq!(doc.data["confidence"], 0.87);
        assert_eq!(doc.data["projectId"], "");
        assert!(doc.data.get("timestamp").is_none());
    }

    #[tokio::test]
    async fn same_named_files_in_one_batch_keep_their_own_blobs() {
        let inference = ScriptedInferenceClient::new().with(
            "IMG.jpg",
            Prediction::Label {
                species: "Crab".into(),
                confidence: Some(0.5),
            },
        );
        let (docs, blobs, ingestor) = fixture(inference, IngestLimits::default()).await;
        let jpeg = |byte: u8| ImagePayload {
            filename: "IMG.jpg".into(),
            content_type: "image/jpeg".into(),
            bytes: vec![byte; 3],
        };
        let report = ingestor
            .analyze_batch(
                &Session::new("u1").unwrap(),
                "p1",
                AnalysisMode::SingleLabel,
                vec![jpeg(1), jpeg(2)],
            )
            .await
            .unwrap();
        assert_eq!(report.successful, 2);

        let mut paths = Vec::new();
        for (outcome, byte) in report.results.iter().zip([1u8, 2]) {
            let ImageOutcome::Analyzed { record_id, .. } = outcome else {
                panic!("expected success");
            };
            let doc = docs.get(ANALYSES, record_id).await.unwrap().unwrap();
            let path = doc.data["imagePath"].as_str().unwrap().to_string();
            assert!(path.ends_with("-IMG.jpg"));
            assert_eq!(blobs.get(&path).await.unwrap().0, vec![byte; 3]);
            paths.push(path);
        }
        assert_ne!(paths[0], paths[1]);
    }

    #[tokio::test]
    async fn classifier_results_without_confidence_stay_single_label() {
        let inference = ScriptedInferenceClient::new().with(
            "a.png",
            Prediction::Label {
                species: "Eel".into(),
                confidence: None,
            },
        );
        let (docs, _blobs, ingestor) = fixture(inference, IngestLimits::default()).await;
        let report = ingestor
            .analyze_batch(
                &Session::new("u1").unwrap(),
                "p1",
                AnalysisMode::SingleLabel,
                vec![png("a.png")],
            )
            .await
            .unwrap();
        let ImageOutcome::Analyzed { record_id, .. } = &report.results[0] else {
            panic!("expected success");
        };
        let doc = docs.get(ANALYSES, record_id).await.unwrap().unwrap();
        assert_eq!(doc.data["mode"], "single");

        let record = crate::reconcile::decode_raw(&doc)
            .unwrap()
            .into_record(String::new(), String::new());
        assert_eq!(record.mode(), AnalysisMode::SingleLabel);
        assert_eq!(record.confidence(), None);
        assert_eq!(record.species, "Eel");
    }

    #[tokio::test]
    async fn oversized_batches_and_files_are_rejected() {
        let limits = IngestLimits {
            max_file_bytes: 2,
            max_batch: 2,
        };
        let (docs, _blobs, ingestor) = fixture(ScriptedInferenceClient::new(), limits).await;
        let session = Session::new("u1").unwrap();

        let batch = vec![png("a.png"), png("b.png"), png("c.png")];
        assert!(matches!(
            ingestor
                .analyze_batch(&session, "p1", AnalysisMode::SingleLabel, batch)
                .await,
            Err(PipelineError::InvalidInput(_))
        ));

        let report = ingestor
            .analyze_batch(&session, "p1", AnalysisMode::SingleLabel, vec![png("a.png")])
            .await
            .unwrap();
        let ImageOutcome::Failed { error, .. } = &report.results[0] else {
            panic!("expected size failure");
        };
        assert!(error.contains("limit is 2"));
        assert_eq!(docs.len(ANALYSES).await, 0);
    }

    #[tokio::test]
    async fn foreign_projects_are_refused_before_upload() {
        let (_docs, blobs, ingestor) =
            fixture(ScriptedInferenceClient::new(), IngestLimits::default()).await;
        let result = ingestor
            .analyze_batch(
                &Session::new("intruder").unwrap(),
                "p1",
                AnalysisMode::SingleLabel,
                vec![png("a.png")],
            )
            .await;
        assert!(matches!(result, Err(PipelineError::Access { .. })));
        assert_eq!(blobs.resolve_calls(), 0);
    }
}
