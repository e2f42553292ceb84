//! Read-path repair of stored image URLs.
//!
//! Stored download URLs go stale or were written broken; the storage path is
//! the durable reference. Reconciliation keeps usable URLs, re-resolves and
//! persists a fresh URL from the path when it can, and otherwise hands out a
//! record with empty image fields. It never fails.

use std::sync::Arc;
use std::time::Duration;

use aqua_core::{AnalysisRecord, RawAnalysisRecord};
use aqua_storage::{BlobStore, Document, DocumentStore, ANALYSES};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

const BROKEN_SEGMENT: &str = "undefined";

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

pub fn looks_like_url(s: &str) -> bool {
    starts_with_ignore_case(s, "http://") || starts_with_ignore_case(s, "https://")
}

/// True when the URL path names an `undefined` segment, either as a plain
/// path component or inside a percent-encoded object path.
pub fn looks_broken(s: &str) -> bool {
    let end = s.find(['?', '#']).unwrap_or(s.len());
    s[..end]
        .replace("%2F", "/")
        .replace("%2f", "/")
        .split('/')
        .any(|segment| segment == BROKEN_SEGMENT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Stored URL kept as is.
    Usable,
    /// Fresh URL resolved from the storage path.
    Repaired,
    /// No usable image reference.
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub usable: usize,
    pub repaired: usize,
    pub missing: usize,
}

impl ReconcileSummary {
    fn count(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Usable => self.usable += 1,
            ReconcileOutcome::Repaired => self.repaired += 1,
            ReconcileOutcome::Missing => self.missing += 1,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    concurrency: usize,
    resolve_timeout: Duration,
}

impl Reconciler {
    pub fn new(documents: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            documents,
            blobs,
            concurrency: 8,
            resolve_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub async fn reconcile(&self, raw: RawAnalysisRecord) -> AnalysisRecord {
        self.reconcile_with_outcome(raw).await.0
    }

    pub async fn reconcile_with_outcome(
        &self,
        raw: RawAnalysisRecord,
    ) -> (AnalysisRecord, ReconcileOutcome) {
        let stored_url = raw.stored_url().to_string();
        let stored_path = raw.stored_path().to_string();

        if looks_like_url(&stored_url) && !looks_broken(&stored_url) {
            let image_path = if stored_path.is_empty() {
                stored_url.clone()
            } else {
                stored_path
            };
            return (raw.into_record(stored_url, image_path), ReconcileOutcome::Usable);
        }

        if !stored_path.trim().is_empty() {
            if let Some(fresh) = self.resolve(&raw.id, &stored_path).await {
                self.persist_repair(&raw.id, &stored_path, &fresh).await;
                return (raw.into_record(fresh, stored_path), ReconcileOutcome::Repaired);
            }
        }

        debug!(id = %raw.id, "no usable image reference");
        (raw.into_record(String::new(), String::new()), ReconcileOutcome::Missing)
    }

    /// Reconcile a batch with a bounded number of records in flight; output
    /// order matches input order.
    pub async fn reconcile_all(&self, raws: Vec<RawAnalysisRecord>) -> Vec<AnalysisRecord> {
        self.reconcile_all_with_summary(raws).await.0
    }

    pub async fn reconcile_all_with_summary(
        &self,
        raws: Vec<RawAnalysisRecord>,
    ) -> (Vec<AnalysisRecord>, ReconcileSummary) {
        let results: Vec<(AnalysisRecord, ReconcileOutcome)> = stream::iter(raws)
            .map(|raw| self.reconcile_with_outcome(raw))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut summary = ReconcileSummary::default();
        let records = results
            .into_iter()
            .map(|(record, outcome)| {
                summary.count(outcome);
                record
            })
            .collect();
        (records, summary)
    }

    async fn resolve(&self, id: &str, path: &str) -> Option<String> {
        match tokio::time::timeout(self.resolve_timeout, self.blobs.resolve_url(path)).await {
            Ok(Ok(url)) => Some(url),
            Ok(Err(err)) => {
                warn!(id, path, error = %err, "could not resolve image path");
                None
            }
            Err(_) => {
                warn!(id, path, "image path resolution timed out");
                None
            }
        }
    }

    async fn persist_repair(&self, id: &str, path: &str, url: &str) {
        if id.is_empty() {
            warn!(path, "repaired record has no id; not persisted");
            return;
        }
        let mut fields = Map::new();
        fields.insert("imagePath".to_string(), Value::String(path.to_string()));
        fields.insert("imageUrl".to_string(), Value::String(url.to_string()));
        if let Err(err) = self.documents.update_fields(ANALYSES, id, fields).await {
            warn!(id, error = %err, "failed to persist repaired image url");
        }
    }
}

/// Decode a stored analysis document, attaching its identity. Undecodable
/// documents are logged and dropped.
pub fn decode_raw(doc: &Document) -> Option<RawAnalysisRecord> {
    match doc.decode::<RawAnalysisRecord>() {
        Ok(raw) => Some(raw.with_identity(doc.id.clone(), doc.created_at)),
        Err(err) => {
            warn!(id = %doc.id, error = %err, "skipping undecodable analysis document");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_storage::{MemoryBlobStore, MemoryDocumentStore};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn raw(id: &str, url: Option<&str>, path: Option<&str>) -> RawAnalysisRecord {
        RawAnalysisRecord {
            user_id: Some("u1".into()),
            project_id: Some("p1".into()),
            image_url: url.map(Into::into),
            image_path: path.map(Into::into),
            species: Some("Crab".into()),
            confidence: Some(0.8),
            ..Default::default()
        }
        .with_identity(id, Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).single().unwrap())
    }

    async fn fixture(
        blobs: MemoryBlobStore,
    ) -> (Arc<MemoryDocumentStore>, Arc<MemoryBlobStore>, Reconciler) {
        let docs = Arc::new(MemoryDocumentStore::recording());
        docs.seed(ANALYSES, "r1", json!({"species": "Crab"})).await;
        docs.seed(ANALYSES, "r2", json!({"species": "Crab"})).await;
        let blobs = Arc::new(blobs);
        let reconciler = Reconciler::new(docs.clone(), blobs.clone());
        (docs, blobs, reconciler)
    }

    #[test]
    fn url_classification() {
        assert!(looks_like_url("https://x/y"));
        assert!(looks_like_url("HTTP://x"));
        assert!(!looks_like_url(""));
        assert!(!looks_like_url("gs://bucket/a.png"));
        assert!(!looks_like_url("uploads/u1/a.png"));

        assert!(looks_broken("https://x/y%2Fundefined"));
        assert!(looks_broken("https://x/undefined/a.png"));
        assert!(looks_broken("https://x/o/uploads%2fundefined%2F1-a.png?alt=media"));
        assert!(!looks_broken("https://x/o/a.png?name=undefined"));
        assert!(!looks_broken("https://x/o/a.png#undefined"));
        assert!(!looks_broken("https://x/undefinedness.png"));
    }

    #[tokio::test]
    async fn usable_url_is_kept_without_writes() {
        let (docs, blobs, reconciler) = fixture(MemoryBlobStore::default()).await;
        let record = reconciler
            .reconcile(raw("r1", Some("https://cdn/a.png"), None))
            .await;
        assert_eq!(record.image_url, "https://cdn/a.png");
        assert_eq!(record.image_path, "https://cdn/a.png");
        assert!(docs.update_calls().await.is_empty());
        assert_eq!(blobs.resolve_calls(), 0);

        let record = reconciler
            .reconcile(raw("r1", Some("https://cdn/a.png"), Some("uploads/u1/a.png")))
            .await;
        assert_eq!(record.image_path, "uploads/u1/a.png");
    }

    #[tokio::test]
    async fn broken_url_is_repaired_from_path() {
        let blobs = MemoryBlobStore::default()
            .with_url("uploads/u1/42-a.png", "https://fresh/url")
            .await;
        let (docs, _blobs, reconciler) = fixture(blobs).await;

        let record = reconciler
            .reconcile(raw("r1", Some("https://x/y%2Fundefined"), Some("uploads/u1/42-a.png")))
            .await;
        assert_eq!(record.image_url, "https://fresh/url");
        assert_eq!(record.image_path, "uploads/u1/42-a.png");

        let calls = docs.update_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].collection, ANALYSES);
        assert_eq!(calls[0].id, "r1");
        assert_eq!(calls[0].fields["imageUrl"], "https://fresh/url");
        assert_eq!(calls[0].fields["imagePath"], "uploads/u1/42-a.png");
    }

    #[tokio::test]
    async fn failed_persist_still_returns_fresh_url() {
        let blobs = MemoryBlobStore::default()
            .with_url("uploads/u1/a.png", "https://fresh/a")
            .await;
        let (docs, _blobs, reconciler) = fixture(blobs).await;
        docs.fail_updates(true);

        let (record, outcome) = reconciler
            .reconcile_with_outcome(raw("r1", None, Some("uploads/u1/a.png")))
            .await;
        assert_eq!(record.image_url, "https://fresh/a");
        assert_eq!(outcome, ReconcileOutcome::Repaired);
    }

    #[tokio::test]
    async fn unresolvable_or_empty_references_become_placeholders() {
        let (docs, blobs, reconciler) = fixture(MemoryBlobStore::default()).await;

        let record = reconciler.reconcile(raw("r1", Some(""), Some(""))).await;
        assert_eq!(record.image_url, "");
        assert_eq!(record.image_path, "");
        assert_eq!(blobs.resolve_calls(), 0);

        let (record, outcome) = reconciler
            .reconcile_with_outcome(raw("r2", Some("https://x/undefined"), Some("uploads/u1/gone.png")))
            .await;
        assert_eq!(record.image_url, "");
        assert_eq!(outcome, ReconcileOutcome::Missing);
        assert_eq!(blobs.resolve_calls(), 1);
        assert!(docs.update_calls().await.is_empty());
        assert_eq!(record.species, "Crab");
    }

    #[tokio::test]
    async fn reconciling_a_canonical_record_is_a_no_op() {
        let blobs = MemoryBlobStore::default()
            .with_url("uploads/u1/a.png", "https://fresh/a")
            .await;
        let (docs, _blobs, reconciler) = fixture(blobs).await;
        let first = reconciler
            .reconcile(raw("r1", Some("https://x/undefined"), Some("uploads/u1/a.png")))
            .await;
        let second = reconciler.reconcile(first.to_raw()).await;
        assert_eq!(first, second);
        assert_eq!(docs.update_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn batches_keep_input_order() {
        let blobs = MemoryBlobStore::default()
            .with_url("uploads/u1/b.png", "https://fresh/b")
            .await;
        let (_docs, _blobs, reconciler) = fixture(blobs).await;
        let reconciler = reconciler.with_concurrency(2);
        let raws = vec![
            raw("r1", Some("https://cdn/a.png"), None),
            raw("r2", None, Some("uploads/u1/b.png")),
            raw("r3", None, None),
            raw("r4", Some("https://cdn/d.png"), None),
        ];
        let (records, summary) = reconciler.reconcile_all_with_summary(raws).await;
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3", "r4"]);
        assert_eq!(
            summary,
            ReconcileSummary {
                usable: 2,
                repaired: 1,
                missing: 1
            }
        );
    }

    #[test]
    fn undecodable_documents_are_skipped() {
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).single().unwrap();
        let good = Document {
            id: "a".into(),
            created_at: created,
            data: json!({"species": "Eel", "url": "https://legacy/a"}),
        };
        let bad = Document {
            id: "b".into(),
            created_at: created,
            data: json!({"species": 7}),
        };
        let raw = decode_raw(&good).unwrap();
        assert_eq!(raw.id, "a");
        assert_eq!(raw.timestamp, Some(created));
        assert_eq!(raw.stored_url(), "https://legacy/a");
        assert!(decode_raw(&bad).is_none());
    }

    /// Answers every resolution, but only after `delay`.
    struct SlowBlobStore {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl BlobStore for SlowBlobStore {
        async fn resolve_url(&self, path: &str) -> Result<String, aqua_storage::StoreError> {
            tokio::time::sleep(self.delay).await;
            Ok(format!("https://slow/{path}"))
        }

        async fn put(
            &self,
            _path: &str,
            _bytes: Vec<u8>,
            _content_type: &str,
        ) -> Result<(), aqua_storage::StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolution_timeout_falls_through_to_placeholder() {
        let docs = Arc::new(MemoryDocumentStore::recording());
        docs.seed(ANALYSES, "r1", json!({"species": "Crab"})).await;
        let slow = Arc::new(SlowBlobStore {
            delay: Duration::from_secs(5),
        });
        let reconciler = Reconciler::new(docs.clone(), slow)
            .with_resolve_timeout(Duration::from_millis(10));

        let (record, outcome) = reconciler
            .reconcile_with_outcome(raw("r1", Some("https://x/y%2Fundefined"), Some("uploads/u1/a.png")))
            .await;
        assert_eq!(outcome, ReconcileOutcome::Missing);
        assert_eq!(record.image_url, "");
        assert_eq!(record.image_path, "");
        assert!(docs.update_calls().await.is_empty());
    }
}
