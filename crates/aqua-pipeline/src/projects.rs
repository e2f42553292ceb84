use std::collections::BTreeMap;
use std::sync::Arc;

use aqua_core::{Project, User};
use aqua_storage::{Direction, DocumentStore, Query, PROJECTS, USERS};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::notify::Notifier;
use crate::{PipelineError, Session};

#[derive(Clone)]
pub struct ProjectService {
    documents: Arc<dyn DocumentStore>,
    notifier: Notifier,
}

impl ProjectService {
    pub fn new(documents: Arc<dyn DocumentStore>, notifier: Notifier) -> Self {
        Self {
            documents,
            notifier,
        }
    }

    async fn load(&self, project_id: &str) -> Result<Project, PipelineError> {
        if project_id.trim().is_empty() {
            return Err(PipelineError::MissingId("project id"));
        }
        let doc = self
            .documents
            .get(PROJECTS, project_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                kind: "project",
                id: project_id.to_string(),
            })?;
        Ok(doc.decode::<Project>()?.normalized(doc.id))
    }

    /// Load a project the caller owns or is a member of.
    pub async fn get(&self, session: &Session, project_id: &str) -> Result<Project, PipelineError> {
        let project = self.load(project_id).await?;
        if !project.can_access(session.user_id()) {
            return Err(access_denied(session, project_id));
        }
        Ok(project)
    }

    async fn get_owned(&self, session: &Session, project_id: &str) -> Result<Project, PipelineError> {
        let project = self.get(session, project_id).await?;
        if !project.is_owner(session.user_id()) {
            return Err(access_denied(session, project_id));
        }
        Ok(project)
    }

    /// Projects the caller owns or belongs to, newest first.
    pub async fn list_for_user(&self, session: &Session) -> Result<Vec<Project>, PipelineError> {
        let owned = Query::new()
            .eq("userId", session.user_id())
            .order_by_created(Direction::Desc);
        let shared = Query::new()
            .array_contains("members", session.user_id())
            .order_by_created(Direction::Desc);

        let mut by_id = BTreeMap::new();
        for query in [owned, shared] {
            for doc in self.documents.query(PROJECTS, &query).await? {
                let project = doc.decode::<Project>()?.normalized(doc.id);
                by_id.insert(project.id.clone(), project);
            }
        }
        let mut projects: Vec<Project> = by_id.into_values().collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    /// Id to name map for the caller's projects.
    pub async fn names_for_user(
        &self,
        session: &Session,
    ) -> Result<std::collections::HashMap<String, String>, PipelineError> {
        Ok(self
            .list_for_user(session)
            .await?
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect())
    }

    pub async fn create(
        &self,
        session: &Session,
        name: &str,
        description: &str,
    ) -> Result<Project, PipelineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PipelineError::InvalidInput("project name is required".into()));
        }
        let project = Project::new(name, description.trim(), session.user_id(), Utc::now());
        let data = serde_json::to_value(&project).map_err(aqua_storage::StoreError::from)?;
        let doc = self.documents.insert(PROJECTS, data).await?;
        info!(project_id = %doc.id, owner = session.user_id(), "project created");
        Ok(project.normalized(doc.id))
    }

    pub async fn rename(
        &self,
        session: &Session,
        project_id: &str,
        name: &str,
    ) -> Result<Project, PipelineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PipelineError::InvalidInput("project name is required".into()));
        }
        let mut project = self.get_owned(session, project_id).await?;
        self.write(project_id, fields([("name", json!(name))])).await?;
        project.name = name.to_string();
        Ok(project)
    }

    pub async fn describe(
        &self,
        session: &Session,
        project_id: &str,
        description: &str,
    ) -> Result<Project, PipelineError> {
        let mut project = self.get_owned(session, project_id).await?;
        let description = description.trim();
        self.write(project_id, fields([("description", json!(description))]))
            .await?;
        project.description = description.to_string();
        Ok(project)
    }

    /// Add a member and invite them. Adding the owner or an existing member
    /// changes nothing.
    pub async fn add_member(
        &self,
        session: &Session,
        project_id: &str,
        member_user_id: &str,
    ) -> Result<Project, PipelineError> {
        let member_user_id = member_user_id.trim();
        if member_user_id.is_empty() {
            return Err(PipelineError::MissingId("member user id"));
        }
        let before = self.get_owned(session, project_id).await?;
        let mut after = before.clone();
        if !after.add_member(member_user_id) {
            return Ok(after);
        }
        self.write(project_id, fields([("members", json!(after.members))]))
            .await?;
        self.notifier.project_updated(&before, &after).await;
        Ok(after)
    }

    pub async fn remove_member(
        &self,
        session: &Session,
        project_id: &str,
        member_user_id: &str,
    ) -> Result<Project, PipelineError> {
        let mut project = self.get_owned(session, project_id).await?;
        if project.remove_member(member_user_id.trim()) {
            self.write(project_id, fields([("members", json!(project.members))]))
                .await?;
        }
        Ok(project)
    }

    /// Delete the project document. Its analyses are left in place.
    pub async fn delete(&self, session: &Session, project_id: &str) -> Result<(), PipelineError> {
        self.get_owned(session, project_id).await?;
        self.documents.delete(PROJECTS, project_id).await?;
        info!(project_id, "project deleted");
        Ok(())
    }

    async fn write(&self, project_id: &str, fields: Map<String, Value>) -> Result<(), PipelineError> {
        Ok(self.documents.update_fields(PROJECTS, project_id, fields).await?)
    }
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn access_denied(session: &Session, project_id: &str) -> PipelineError {
    PipelineError::Access {
        user_id: session.user_id().to_string(),
        kind: "project",
        id: project_id.to_string(),
    }
}

/// Directory of known users, keyed by the identity provider's user id.
#[derive(Clone)]
pub struct UserService {
    documents: Arc<dyn DocumentStore>,
    notifier: Notifier,
}

impl UserService {
    pub fn new(documents: Arc<dyn DocumentStore>, notifier: Notifier) -> Self {
        Self {
            documents,
            notifier,
        }
    }

    pub async fn find(&self, user_id: &str) -> Result<Option<User>, PipelineError> {
        let docs = self
            .documents
            .query(USERS, &Query::new().eq("uid", user_id).limit(1))
            .await?;
        match docs.first() {
            Some(doc) => Ok(Some(doc.decode::<User>()?)),
            None => Ok(None),
        }
    }

    /// Record the caller in the directory on first sight and send the
    /// welcome email. Later calls return the stored user unchanged.
    pub async fn ensure(
        &self,
        session: &Session,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<User, PipelineError> {
        if let Some(existing) = self.find(session.user_id()).await? {
            return Ok(existing);
        }
        let email = email.trim();
        if email.is_empty() {
            return Err(PipelineError::InvalidInput("email is required".into()));
        }
        let user = User {
            id: session.user_id().to_string(),
            email: email.to_string(),
            display_name: display_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(ToString::to_string),
        };
        let mut data = serde_json::to_value(&user).map_err(aqua_storage::StoreError::from)?;
        if let Value::Object(body) = &mut data {
            body.insert("createdAt".to_string(), json!(Utc::now()));
        }
        self.documents.insert(USERS, data).await?;
        info!(user_id = %user.id, "user registered");
        self.notifier.user_created(&user).await;
        Ok(user)
    }
}
