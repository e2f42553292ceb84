use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{BlobStore, Direction, Document, DocumentStore, OrderBy, Query, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCall {
    pub collection: String,
    pub id: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    doc: Document,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    last_created: Option<DateTime<Utc>>,
    collections: BTreeMap<String, Vec<Slot>>,
}

/// Process-local document store used by tests and database-less `serve`.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: RwLock<MemoryState>,
    /// `None` unless built with [`MemoryDocumentStore::recording`].
    updates: Option<Mutex<Vec<UpdateCall>>>,
    fail_updates: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that keeps every `update_fields` call for [`update_calls`].
    ///
    /// [`update_calls`]: MemoryDocumentStore::update_calls
    pub fn recording() -> Self {
        Self {
            updates: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Make every subsequent `update_fields` fail.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, AtomicOrdering::SeqCst);
    }

    /// Insert a document under a caller-chosen id, replacing any previous body.
    pub async fn seed(&self, collection: &str, id: &str, data: Value) -> Document {
        let mut state = self.state.write().await;
        let created_at = next_created_at(&mut state);
        let seq = state.next_seq;
        state.next_seq += 1;
        let doc = Document {
            id: id.to_string(),
            created_at,
            data,
        };
        let slots = state.collections.entry(collection.to_string()).or_default();
        slots.retain(|s| s.doc.id != id);
        slots.push(Slot {
            seq,
            doc: doc.clone(),
        });
        doc
    }

    /// Always empty for a store built with [`MemoryDocumentStore::new`].
    pub async fn update_calls(&self) -> Vec<UpdateCall> {
        match &self.updates {
            Some(updates) => updates.lock().await.clone(),
            None => Vec::new(),
        }
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.state
            .read()
            .await
            .collections
            .get(collection)
            .map_or(0, Vec::len)
    }
}

fn next_created_at(state: &mut MemoryState) -> DateTime<Utc> {
    let now = Utc::now();
    let created = match state.last_created {
        Some(last) if last > now => last,
        _ => now,
    };
    state.last_created = Some(created);
    created
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .collections
            .get(collection)
            .and_then(|slots| slots.iter().find(|s| s.doc.id == id))
            .map(|s| s.doc.clone()))
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let state = self.state.read().await;
        let mut slots = state
            .collections
            .get(collection)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|s| query.matches(&s.doc.data))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        match &query.order_by {
            Some(OrderBy::CreatedAt(direction)) => {
                slots.sort_by(|a, b| {
                    let ord = a.doc.created_at.cmp(&b.doc.created_at).then(a.seq.cmp(&b.seq));
                    if *direction == Direction::Desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
            Some(OrderBy::Field(field, direction)) => {
                slots.sort_by(|a, b| {
                    let ord = compare_json(a.doc.data.get(field), b.doc.data.get(field))
                        .then(a.seq.cmp(&b.seq));
                    if *direction == Direction::Desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
            None => slots.sort_by_key(|s| s.seq),
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(slots.into_iter().take(limit).map(|s| s.doc).collect())
    }

    async fn insert(&self, collection: &str, data: Value) -> Result<Document, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        Ok(self.seed(collection, &id, data).await)
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        if let Some(updates) = &self.updates {
            updates.lock().await.push(UpdateCall {
                collection: collection.to_string(),
                id: id.to_string(),
                fields: fields.clone(),
            });
        }
        if self.fail_updates.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Message(format!(
                "update of {collection}/{id} rejected"
            )));
        }

        let mut state = self.state.write().await;
        let slot = state
            .collections
            .get_mut(collection)
            .and_then(|slots| slots.iter_mut().find(|s| s.doc.id == id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        match &mut slot.doc.data {
            Value::Object(body) => body.extend(fields),
            other => *other = Value::Object(fields),
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let slots = state.collections.entry(collection.to_string()).or_default();
        let before = slots.len();
        slots.retain(|s| s.doc.id != id);
        if slots.len() == before {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

/// Process-local blob store; uploaded paths resolve under `base_url`.
#[derive(Debug)]
pub struct MemoryBlobStore {
    base_url: String,
    urls: RwLock<HashMap<String, String>>,
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
    resolve_calls: AtomicUsize,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new("http://localhost/blobs")
    }
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            urls: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            resolve_calls: AtomicUsize::new(0),
        }
    }

    /// Register a fixed URL for `path` without storing any bytes.
    pub async fn with_url(self, path: &str, url: &str) -> Self {
        self.urls
            .write()
            .await
            .insert(path.to_string(), url.to_string());
        self
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(AtomicOrdering::SeqCst)
    }

    pub async fn get(&self, path: &str) -> Option<(Vec<u8>, String)> {
        self.blobs.read().await.get(path).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn resolve_url(&self, path: &str) -> Result<String, StoreError> {
        self.resolve_calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.urls
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound(path.to_string()))
    }

    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        self.blobs
            .write()
            .await
            .insert(path.to_string(), (bytes, content_type.to_string()));
        self.urls
            .write()
            .await
            .insert(path.to_string(), format!("{}/{}", self.base_url, path));
        Ok(())
    }
}
