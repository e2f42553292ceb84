use std::sync::Arc;

use aqua_core::AnalysisRecord;
use aqua_storage::{Direction, DocumentStore, Query, ANALYSES};
use chrono::TimeZone;
use tracing::{info, info_span, Instrument};

use crate::export::export_csv;
use crate::metrics::{aggregate, aggregate_local, ProjectMetrics};
use crate::projects::ProjectService;
use crate::reconcile::{decode_raw, ReconcileSummary, Reconciler};
use crate::{PipelineError, Session};

/// Loads analysis records through the reconciler, enforcing project access.
#[derive(Clone)]
pub struct RecordService {
    documents: Arc<dyn DocumentStore>,
    projects: ProjectService,
    reconciler: Reconciler,
}

impl RecordService {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        projects: ProjectService,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            documents,
            projects,
            reconciler,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    async fn load(&self, query: Query) -> Result<(Vec<AnalysisRecord>, ReconcileSummary), PipelineError> {
        let docs = self.documents.query(ANALYSES, &query).await?;
        let raws = docs.iter().filter_map(decode_raw).collect();
        let (mut records, summary) = self.reconciler.reconcile_all_with_summary(raws).await;
        // stored timestamps may predate the creation order
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok((records, summary))
    }

    /// Every record in the project, newest first.
    pub async fn load_project_records(
        &self,
        session: &Session,
        project_id: &str,
    ) -> Result<Vec<AnalysisRecord>, PipelineError> {
        Ok(self.load_project_records_with_summary(session, project_id).await?.0)
    }

    pub async fn load_project_records_with_summary(
        &self,
        session: &Session,
        project_id: &str,
    ) -> Result<(Vec<AnalysisRecord>, ReconcileSummary), PipelineError> {
        self.projects.get(session, project_id).await?;
        let query = Query::new()
            .eq("projectId", project_id)
            .order_by_created(Direction::Desc);
        let span = info_span!("load_project_records", project_id);
        let (records, summary) = self.load(query).instrument(span).await?;
        info!(
            project_id,
            records = records.len(),
            repaired = summary.repaired,
            missing = summary.missing,
            "project records loaded"
        );
        Ok((records, summary))
    }

    /// The caller's own latest records across all projects.
    pub async fn load_recent(
        &self,
        session: &Session,
        limit: usize,
    ) -> Result<Vec<AnalysisRecord>, PipelineError> {
        let query = Query::new()
            .eq("userId", session.user_id())
            .order_by_created(Direction::Desc)
            .limit(limit);
        Ok(self.load(query).await?.0)
    }

    pub async fn project_metrics<Tz: TimeZone>(
        &self,
        session: &Session,
        project_id: &str,
        tz: &Tz,
    ) -> Result<ProjectMetrics, PipelineError> {
        let records = self.load_project_records(session, project_id).await?;
        Ok(aggregate(&records, tz))
    }

    /// Metrics with day boundaries in the server's zone, using each record's
    /// own UTC offset.
    pub async fn project_metrics_local(
        &self,
        session: &Session,
        project_id: &str,
    ) -> Result<ProjectMetrics, PipelineError> {
        let records = self.load_project_records(session, project_id).await?;
        Ok(aggregate_local(&records))
    }

    pub async fn export_project_csv<Tz: TimeZone>(
        &self,
        session: &Session,
        project_id: &str,
        tz: &Tz,
    ) -> anyhow::Result<String> {
        let project = self.projects.get(session, project_id).await?;
        let records = self.load_project_records(session, project_id).await?;
        let names = std::collections::HashMap::from([(project.id, project.name)]);
        export_csv(&records, &names, tz)
    }

    /// Only the record's owner may delete it.
    pub async fn delete_record(&self, session: &Session, record_id: &str) -> Result<(), PipelineError> {
        if record_id.trim().is_empty() {
            return Err(PipelineError::MissingId("record id"));
        }
        let doc = self
            .documents
            .get(ANALYSES, record_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                kind: "analysis",
                id: record_id.to_string(),
            })?;
        let owner = doc.field("userId").and_then(|v| v.as_str()).unwrap_or_default();
        if owner != session.user_id() {
            return Err(PipelineError::Access {
                user_id: session.user_id().to_string(),
                kind: "analysis",
                id: record_id.to_string(),
            });
        }
        self.documents.delete(ANALYSES, record_id).await?;
        info!(record_id, "analysis deleted");
        Ok(())
    }
}
