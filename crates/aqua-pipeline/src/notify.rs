//! Outbound email for account creation and project membership changes.
//!
//! Delivery is best effort: failures are logged and never fail the write
//! that triggered them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aqua_core::{Project, User};
use aqua_storage::{DocumentStore, Query, USERS};
use askama::Template;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};

const FALLBACK_NAME: &str = "there";
const FALLBACK_OWNER: &str = "A researcher";
const FROM_NAME: &str = "AquaSense Team";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[derive(Template)]
#[template(path = "email/welcome.txt")]
struct WelcomeText<'a> {
    name: &'a str,
    app_url: &'a str,
}

#[derive(Template)]
#[template(path = "email/welcome.html")]
struct WelcomeHtml<'a> {
    name: &'a str,
    email: &'a str,
    app_url: &'a str,
}

#[derive(Template)]
#[template(path = "email/invitation.txt")]
struct InvitationText<'a> {
    name: &'a str,
    owner_name: &'a str,
    project_name: &'a str,
    project_description: &'a str,
    app_url: &'a str,
}

#[derive(Template)]
#[template(path = "email/invitation.html")]
struct InvitationHtml<'a> {
    name: &'a str,
    email: &'a str,
    owner_name: &'a str,
    project_id: &'a str,
    project_name: &'a str,
    project_description: &'a str,
    app_url: &'a str,
}

fn display_name<'a>(user: &'a User, fallback: &'a str) -> &'a str {
    user.display_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(fallback)
}

pub fn welcome_message(user: &User, app_url: &str) -> Result<EmailMessage> {
    let name = display_name(user, FALLBACK_NAME);
    Ok(EmailMessage {
        to: user.email.clone(),
        subject: "Welcome to AquaSense!".to_string(),
        text: WelcomeText { name, app_url }
            .render()
            .context("rendering welcome text")?,
        html: WelcomeHtml {
            name,
            email: &user.email,
            app_url,
        }
        .render()
        .context("rendering welcome html")?,
    })
}

/// One invitation per member present in `after` but not in `before`.
/// Members missing from `directory` are logged and skipped.
pub fn invitation_messages(
    before: &Project,
    after: &Project,
    owner: Option<&User>,
    directory: &HashMap<String, User>,
    app_url: &str,
) -> Result<Vec<EmailMessage>> {
    let owner_name = owner
        .map(|o| display_name(o, FALLBACK_OWNER))
        .unwrap_or(FALLBACK_OWNER);
    let project_name = if after.name.trim().is_empty() {
        "Untitled Project"
    } else {
        after.name.as_str()
    };
    let project_description = if after.description.trim().is_empty() {
        "No description provided"
    } else {
        after.description.as_str()
    };

    let mut messages = Vec::new();
    for member_id in Project::newly_added_members(before, after) {
        let Some(member) = directory.get(member_id) else {
            warn!(member_id, project_id = %after.id, "invited user not found; no email sent");
            continue;
        };
        let name = display_name(member, FALLBACK_NAME);
        messages.push(EmailMessage {
            to: member.email.clone(),
            subject: format!("You've been added to \"{project_name}\" on AquaSense"),
            text: InvitationText {
                name,
                owner_name,
                project_name,
                project_description,
                app_url,
            }
            .render()
            .context("rendering invitation text")?,
            html: InvitationHtml {
                name,
                email: &member.email,
                owner_name,
                project_id: &after.id,
                project_name,
                project_description,
                app_url,
            }
            .render()
            .context("rendering invitation html")?,
        });
    }
    Ok(messages)
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Logs messages instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, "email not delivered (no mail endpoint)");
        Ok(())
    }
}

/// Posts messages as JSON to a transactional mail endpoint.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        from: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building mail client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            from: from.into(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let body = json!({
            "from": {"email": self.from, "name": FROM_NAME},
            "to": message.to,
            "subject": message.subject,
            "text": message.text,
            "html": message.html,
        });
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let span = info_span!("mail_send", to = %message.to);
        let resp = req
            .send()
            .instrument(span)
            .await
            .with_context(|| format!("posting email to {}", self.endpoint))?;
        resp.error_for_status()
            .with_context(|| format!("mail endpoint rejected message to {}", message.to))?;
        Ok(())
    }
}

/// Reacts to user and project writes by sending the matching emails.
#[derive(Clone)]
pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    documents: Arc<dyn DocumentStore>,
    app_url: String,
}

impl Notifier {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        documents: Arc<dyn DocumentStore>,
        app_url: impl Into<String>,
    ) -> Self {
        Self {
            mailer,
            documents,
            app_url: app_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn user_created(&self, user: &User) {
        let message = match welcome_message(user, &self.app_url) {
            Ok(message) => message,
            Err(err) => {
                warn!(user_id = %user.id, error = %err, "could not build welcome email");
                return;
            }
        };
        self.deliver(&message).await;
    }

    /// Returns the number of invitations handed to the mailer.
    pub async fn project_updated(&self, before: &Project, after: &Project) -> usize {
        let added = Project::newly_added_members(before, after);
        if added.is_empty() {
            return 0;
        }

        let mut wanted: Vec<&str> = added;
        wanted.push(&after.owner_user_id);
        let directory = self.load_users(&wanted).await;
        let owner = directory.get(&after.owner_user_id);

        let messages = match invitation_messages(before, after, owner, &directory, &self.app_url) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(project_id = %after.id, error = %err, "could not build invitation emails");
                return 0;
            }
        };
        for message in &messages {
            self.deliver(message).await;
        }
        messages.len()
    }

    async fn load_users(&self, ids: &[&str]) -> HashMap<String, User> {
        let mut users = HashMap::new();
        for id in ids {
            let query = Query::new().eq("uid", *id).limit(1);
            match self.documents.query(USERS, &query).await {
                Ok(docs) => {
                    if let Some(user) = docs.first().and_then(|d| d.decode::<User>().ok()) {
                        users.insert(user.id.clone(), user);
                    }
                }
                Err(err) => warn!(user_id = id, error = %err, "user lookup failed"),
            }
        }
        users
    }

    async fn deliver(&self, message: &EmailMessage) {
        match self.mailer.send(message).await {
            Ok(()) => info!(to = %message.to, subject = %message.subject, "email sent"),
            Err(err) => warn!(to = %message.to, error = %err, "email delivery failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_storage::MemoryDocumentStore;
    use chrono::Utc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<EmailMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: &EmailMessage) -> Result<()> {
            if self.fail {
                anyhow::bail!("smtp down");
            }
            self.sent.lock().await.push(message.clone());
            Ok(())
        }
    }

    fn user(id: &str, email: &str, name: Option<&str>) -> User {
        User {
            id: id.into(),
            email: email.into(),
            display_name: name.map(Into::into),
        }
    }

    fn project() -> Project {
        let mut p = Project::new("Reef <survey>", "", "owner", Utc::now());
        p.id = "p1".into();
        p.add_member("old");
        p
    }

    #[test]
    fn welcome_uses_display_name_or_fallback() {
        let message = welcome_message(&user("u1", "a@x.org", Some("Ada")), "http://app").unwrap();
        assert_eq!(message.to, "a@x.org");
        assert!(message.text.starts_with("Hi Ada,"));
        assert!(message.html.contains("http://app/"));

        let message = welcome_message(&user("u2", "b@x.org", None), "http://app").unwrap();
        assert!(message.text.starts_with("Hi there,"));
    }

    #[test]
    fn invitations_go_only_to_new_known_members() {
        let before = project();
        let mut after = before.clone();
        after.add_member("new1");
        after.add_member("ghost");

        let directory = HashMap::from([
            ("old".to_string(), user("old", "old@x.org", None)),
            ("new1".to_string(), user("new1", "new1@x.org", Some("Nia"))),
        ]);
        let owner = user("owner", "o@x.org", Some("Dr. Owen"));
        let messages =
            invitation_messages(&before, &after, Some(&owner), &directory, "http://app").unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].to, "new1@x.org");
        assert!(messages[0].subject.contains("Reef <survey>"));
        assert!(messages[0].text.contains("Dr. Owen has invited you"));
        assert!(messages[0].text.contains("No description provided"));
        assert!(messages[0].html.contains("Reef &lt;survey&gt;"));
    }

    #[tokio::test]
    async fn notifier_looks_up_users_and_survives_failures() {
        let docs = Arc::new(MemoryDocumentStore::recording());
        docs.seed(USERS, "d1", json!({"uid": "new1", "email": "new1@x.org"})).await;
        docs.seed(USERS, "d2", json!({"uid": "owner", "email": "o@x.org", "displayName": "Owen"}))
            .await;

        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), docs.clone(), "http://app/");
        let before = project();
        let mut after = before.clone();
        after.add_member("new1");

        assert_eq!(notifier.project_updated(&before, &after).await, 1);
        assert_eq!(notifier.project_updated(&after, &after).await, 0);
        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("Owen has invited you"));
        drop(sent);

        let failing = Notifier::new(
            Arc::new(RecordingMailer {
                fail: true,
                ..Default::default()
            }),
            docs,
            "http://app",
        );
        failing.user_created(&user("new1", "new1@x.org", None)).await;
        assert_eq!(failing.project_updated(&before, &after).await, 1);
    }
}
