//! Client contract for the remote species inference endpoint.

use std::collections::HashMap;

use anyhow::Context;
use aqua_core::{joined_species, AnalysisMode, Detection};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "aqua-inference";

/// Labels emitted by the detection model, in class-id order.
pub const CLASS_LABELS: [&str; 7] = [
    "Crab",
    "Eel",
    "Flatfish",
    "Roundfish",
    "Scallop",
    "Skate",
    "Whelk",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Label {
        species: String,
        confidence: Option<f64>,
    },
    Detections {
        detections: Vec<Detection>,
        annotated_image: Option<String>,
    },
}

impl Prediction {
    pub fn mode(&self) -> AnalysisMode {
        match self {
            Prediction::Label { .. } => AnalysisMode::SingleLabel,
            Prediction::Detections { .. } => AnalysisMode::MultiDetection,
        }
    }

    /// Label stored on the record: the single guess or the joined detections.
    pub fn species_label(&self) -> String {
        match self {
            Prediction::Label { species, .. } => species.clone(),
            Prediction::Detections { detections, .. } => joined_species(detections),
        }
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("inference endpoint returned {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("malformed inference response: {0}")]
    Malformed(String),
    #[error("no prediction available for {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn analyze(
        &self,
        mode: AnalysisMode,
        image: &ImagePayload,
    ) -> Result<Prediction, InferenceError>;
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predicted_species: String,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
    #[serde(default)]
    annotated_image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInferenceClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building inference client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, mode: AnalysisMode) -> String {
        let route = match mode {
            AnalysisMode::SingleLabel => "predict",
            AnalysisMode::MultiDetection => "detect",
        };
        format!("{}/{route}", self.base_url)
    }

    async fn post_image(
        &self,
        mode: AnalysisMode,
        image: &ImagePayload,
    ) -> Result<reqwest::Response, InferenceError> {
        let part = Part::bytes(image.bytes.clone())
            .file_name(image.filename.clone())
            .mime_str(&image.content_type)?;
        let resp = self
            .client
            .post(self.endpoint(mode))
            .multipart(Form::new().part("file", part))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.detail)
            .unwrap_or(body);
        Err(InferenceError::Status {
            status: status.as_u16(),
            detail,
        })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn analyze(
        &self,
        mode: AnalysisMode,
        image: &ImagePayload,
    ) -> Result<Prediction, InferenceError> {
        let span = info_span!("inference", %mode, filename = %image.filename);
        async {
            let resp = self.post_image(mode, image).await?;
            let prediction = match mode {
                AnalysisMode::SingleLabel => {
                    let body: PredictResponse = resp
                        .json()
                        .await
                        .map_err(|e| InferenceError::Malformed(e.to_string()))?;
                    Prediction::Label {
                        species: body.predicted_species,
                        confidence: body.confidence,
                    }
                }
                AnalysisMode::MultiDetection => {
                    let body: DetectResponse = resp
                        .json()
                        .await
                        .map_err(|e| InferenceError::Malformed(e.to_string()))?;
                    Prediction::Detections {
                        detections: body.detections,
                        annotated_image: body.annotated_image,
                    }
                }
            };
            debug!(species = %prediction.species_label(), "inference complete");
            Ok(prediction)
        }
        .instrument(span)
        .await
    }
}

/// Canned predictions keyed by filename, for local runs without a model.
#[derive(Debug, Clone, Default)]
pub struct ScriptedInferenceClient {
    predictions: HashMap<String, Prediction>,
}

impl ScriptedInferenceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filename: impl Into<String>, prediction: Prediction) -> Self {
        self.predictions.insert(filename.into(), prediction);
        self
    }
}

#[async_trait]
impl InferenceClient for ScriptedInferenceClient {
    async fn analyze(
        &self,
        mode: AnalysisMode,
        image: &ImagePayload,
    ) -> Result<Prediction, InferenceError> {
        match self.predictions.get(&image.filename) {
            Some(prediction) if prediction.mode() == mode => Ok(prediction.clone()),
            Some(prediction) => Err(InferenceError::Malformed(format!(
                "{} is scripted for {} mode",
                image.filename,
                prediction.mode()
            ))),
            None => Err(InferenceError::Unavailable(image.filename.clone())),
        }
    }
}
