//! Record reconciliation, metrics and the services built on top of them.

use std::sync::Arc;

use anyhow::{Context, Result};
use aqua_inference::{
    HttpInferenceClient, InferenceClient, InferenceError, ScriptedInferenceClient,
};
use aqua_storage::{
    BlobStore, DocumentStore, HttpBlobStore, HttpClientConfig, MemoryBlobStore,
    MemoryDocumentStore, PgDocumentStore, StoreError,
};
use thiserror::Error;
use tracing::{info, warn};

pub mod catalog;
pub mod config;
pub mod export;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod projects;
pub mod reconcile;
pub mod records;

pub use catalog::{SpeciesCatalog, SpeciesCategory, SpeciesEntry};
pub use config::PipelineConfig;
pub use export::{export_csv, CSV_HEADER};
pub use ingest::{BatchReport, ImageOutcome, IngestLimits, Ingestor};
pub use metrics::{
    aggregate, aggregate_local, ConfidenceBucket, ProjectMetrics, SpeciesCount, TimelinePoint,
};
pub use notify::{
    invitation_messages, welcome_message, EmailMessage, HttpMailer, LogMailer, Mailer, Notifier,
};
pub use projects::{ProjectService, UserService};
pub use reconcile::{looks_broken, looks_like_url, ReconcileOutcome, ReconcileSummary, Reconciler};
pub use records::RecordService;

pub const CRATE_NAME: &str = "aqua-pipeline";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing {0}")]
    MissingId(&'static str),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("user {user_id} may not access {kind} {id}")]
    Access {
        user_id: String,
        kind: &'static str,
        id: String,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// The authenticated caller, passed explicitly to every service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user_id: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Result<Self, PipelineError> {
        let user_id = user_id.into().trim().to_string();
        if user_id.is_empty() {
            return Err(PipelineError::MissingId("user id"));
        }
        Ok(Self { user_id })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Every service wired against one set of store clients.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<PipelineConfig>,
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub projects: ProjectService,
    pub users: UserService,
    pub records: RecordService,
    pub ingestor: Ingestor,
    pub catalog: Arc<SpeciesCatalog>,
}

impl Services {
    pub fn new(
        config: PipelineConfig,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        inference: Arc<dyn InferenceClient>,
        mailer: Arc<dyn Mailer>,
        catalog: SpeciesCatalog,
    ) -> Self {
        let notifier = Notifier::new(mailer, documents.clone(), config.app_url.clone());
        let projects = ProjectService::new(documents.clone(), notifier.clone());
        let users = UserService::new(documents.clone(), notifier);
        let reconciler = Reconciler::new(documents.clone(), blobs.clone())
            .with_concurrency(config.reconcile_concurrency)
            .with_resolve_timeout(config.http_timeout());
        let records = RecordService::new(documents.clone(), projects.clone(), reconciler);
        let ingestor = Ingestor::new(
            documents.clone(),
            blobs.clone(),
            inference,
            projects.clone(),
            IngestLimits {
                max_file_bytes: config.max_file_bytes,
                max_batch: config.max_batch,
            },
        )
        .with_concurrency(config.reconcile_concurrency);

        Self {
            config: Arc::new(config),
            documents,
            blobs,
            projects,
            users,
            records,
            ingestor,
            catalog: Arc::new(catalog),
        }
    }

    /// Build the configured store clients. Without `DATABASE_URL` or a blob
    /// base URL the in-memory stores stand in.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let documents: Arc<dyn DocumentStore> = match &config.database_url {
            Some(url) => {
                let store = PgDocumentStore::connect(url).await?;
                store.migrate().await?;
                info!("using postgres document store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory document store");
                Arc::new(MemoryDocumentStore::new())
            }
        };

        let blobs: Arc<dyn BlobStore> = match &config.blob_base_url {
            Some(base) => Arc::new(HttpBlobStore::new(
                base,
                config.blob_bucket.clone(),
                HttpClientConfig {
                    timeout: config.http_timeout(),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                },
            )?),
            None => {
                warn!("AQUA_BLOB_BASE_URL not set; using in-memory blob store");
                Arc::new(MemoryBlobStore::default())
            }
        };

        let inference: Arc<dyn InferenceClient> = match &config.inference_url {
            Some(url) => Arc::new(HttpInferenceClient::new(url.clone(), config.http_timeout())?),
            None => {
                warn!("AQUA_INFERENCE_URL not set; every analysis will fail");
                Arc::new(ScriptedInferenceClient::new())
            }
        };

        let mailer: Arc<dyn Mailer> = match &config.mail_endpoint {
            Some(endpoint) => Arc::new(HttpMailer::new(
                endpoint.clone(),
                config.mail_api_key.clone(),
                config.mail_from.clone(),
                config.http_timeout(),
            )?),
            None => Arc::new(LogMailer),
        };

        let catalog = SpeciesCatalog::from_path(&config.species_file)
            .with_context(|| format!("loading {}", config.species_file.display()))?;

        Ok(Self::new(config, documents, blobs, inference, mailer, catalog))
    }

    pub async fn from_env() -> Result<Self> {
        Self::connect(PipelineConfig::from_env()).await
    }
}
