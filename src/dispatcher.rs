//! Dispatcher + Context Factory (C5)
//!
//! For each event, builds a capability context bound to the triggering
//! listener's identity and invokes every matching handler with failure
//! isolation (spec.md §4.5). The context is the sole API through which a
//! rule file's `then` actions may cause side effects — it mediates every
//! remote/local coherence step itself, so no handler ever touches the
//! store or the IMAP client directly.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::agent::{AgentGateway, AgentRequest};
use crate::errors::{AppError, AppResult};
use crate::imap::{ImapClient, ops, ops::SelectMode};
use crate::listeners::{Action, Condition, EventKind, ListenerModule, ListenerRegistry};
use crate::notification::{Notification, NotificationSink, Priority};
use crate::store::{EmailFlagsUpdate, MailStore};

const ALL_MAIL_FOLDER: &str = "[Gmail]/All Mail";

/// Tagged event payload (spec.md §9 "Duck-typed event payloads": replaced
/// with a tagged variant so the Dispatcher dispatches on the tag and hands
/// a typed payload to the handler)
#[derive(Debug, Clone)]
pub enum EventPayload {
    Email { message_id: String },
    EmailLabeled { message_id: String, label: String },
    Scheduled { cron: Option<String> },
}

impl EventPayload {
    fn message_id(&self) -> Option<&str> {
        match self {
            Self::Email { message_id } | Self::EmailLabeled { message_id, .. } => {
                Some(message_id.as_str())
            }
            Self::Scheduled { .. } => None,
        }
    }
}

/// Builds a [`Context`] bound to one listener invocation; depends only on
/// `(store, imap client, notification sink, llm gateway)` per spec.md §9,
/// keeping it a pure function free of any dependency on the Sync Service.
pub struct ContextFactory {
    store: Arc<MailStore>,
    imap: Arc<ImapClient>,
    notifications: Arc<dyn NotificationSink>,
    agent: Arc<AgentGateway>,
}

impl ContextFactory {
    pub fn new(
        store: Arc<MailStore>,
        imap: Arc<ImapClient>,
        notifications: Arc<dyn NotificationSink>,
        agent: Arc<AgentGateway>,
    ) -> Self {
        Self {
            store,
            imap,
            notifications,
            agent,
        }
    }

    fn build(&self, listener_id: String, listener_name: String) -> Context<'_> {
        Context {
            listener_id,
            listener_name,
            store: self.store.as_ref(),
            imap: self.imap.as_ref(),
            notifications: &self.notifications,
            agent: self.agent.as_ref(),
        }
    }
}

/// The capability object handed to a listener's `then` actions
///
/// Every mutating method follows the same three-step coherence contract
/// (spec.md §4.5): resolve message-id → stored email, issue the remote
/// IMAP operation, then apply the local mutation. If the remote step
/// succeeds but the local write fails, the mirror is tolerated as
/// divergent but the divergence is logged — the next sync converges it.
pub struct Context<'a> {
    listener_id: String,
    listener_name: String,
    store: &'a MailStore,
    imap: &'a ImapClient,
    notifications: &'a Arc<dyn NotificationSink>,
    agent: &'a AgentGateway,
}

impl Context<'_> {
    pub fn notify(&self, message: impl Into<String>, priority: Priority, message_id: Option<String>) {
        self.notifications.notify(Notification {
            listener_id: self.listener_id.clone(),
            listener_name: self.listener_name.clone(),
            priority,
            message: message.into(),
            timestamp: chrono::Utc::now(),
            email_message_id: message_id,
        });
    }

    /// Moves a message to the archive folder and refreshes its server UID
    ///
    /// `MOVE` assigns the message a new UID in the destination mailbox; the
    /// old one no longer identifies it anywhere. A subsequent flag/label
    /// action on this message-id (e.g. `mark_as_read` chained after
    /// `archive_email` in the same listener) must see the refreshed UID or
    /// it will select the destination folder and `UID STORE` against a UID
    /// that belongs to a different message there, or to nothing at all.
    pub async fn archive_email(&self, message_id: &str) -> AppResult<()> {
        let email = self.require_email(message_id)?;
        let uid = email_uid(&email)?;
        let mut guard = self.imap.acquire().await?;
        let session = guard.as_mut().expect("acquire populates session");
        ops::select_mailbox(self.imap.config(), session, &email.folder, SelectMode::ReadWrite)
            .await?;
        let result = ops::uid_move(self.imap.config(), session, uid, ALL_MAIL_FOLDER).await;
        if result.is_err() {
            drop(guard);
            self.imap.invalidate().await;
            return result;
        }

        let session = guard.as_mut().expect("acquire populates session");
        ops::select_mailbox(self.imap.config(), session, ALL_MAIL_FOLDER, SelectMode::ReadWrite)
            .await?;
        let query = format!("HEADER MESSAGE-ID {}", quote_label(message_id));
        let new_uid = ops::uid_search(self.imap.config(), session, &query)
            .await?
            .into_iter()
            .next();
        drop(guard);

        if new_uid.is_none() {
            warn!(message_id, "archive_email: could not re-resolve uid in destination folder");
        }

        self.store.update_email_flags(
            message_id,
            &EmailFlagsUpdate {
                folder: Some(ALL_MAIL_FOLDER.to_owned()),
                uid: new_uid,
                ..Default::default()
            },
        )
    }

    pub async fn star_email(&self, message_id: &str) -> AppResult<()> {
        self.toggle_flag(message_id, "+FLAGS.SILENT (\\Flagged)").await?;
        self.store.update_email_flags(
            message_id,
            &EmailFlagsUpdate {
                is_starred: Some(true),
                ..Default::default()
            },
        )
    }

    pub async fn unstar_email(&self, message_id: &str) -> AppResult<()> {
        self.toggle_flag(message_id, "-FLAGS.SILENT (\\Flagged)").await?;
        self.store.update_email_flags(
            message_id,
            &EmailFlagsUpdate {
                is_starred: Some(false),
                ..Default::default()
            },
        )
    }

    pub async fn mark_as_read(&self, message_id: &str) -> AppResult<()> {
        self.toggle_flag(message_id, "+FLAGS.SILENT (\\Seen)").await?;
        self.store.update_email_flags(
            message_id,
            &EmailFlagsUpdate {
                is_read: Some(true),
                ..Default::default()
            },
        )
    }

    pub async fn mark_as_unread(&self, message_id: &str) -> AppResult<()> {
        self.toggle_flag(message_id, "-FLAGS.SILENT (\\Seen)").await?;
        self.store.update_email_flags(
            message_id,
            &EmailFlagsUpdate {
                is_read: Some(false),
                ..Default::default()
            },
        )
    }

    /// Open Questions (spec.md §9): real Gmail label manipulation is a
    /// distinct command from a generic flag store; this issues a dedicated
    /// `X-GM-LABELS` store query rather than reusing the `FLAGS` verb.
    pub async fn add_label(&self, message_id: &str, label: &str) -> AppResult<()> {
        let query = format!("+X-GM-LABELS.SILENT ({})", quote_label(label));
        self.toggle_flag(message_id, &query).await?;
        let email = self.require_email(message_id)?;
        let mut labels = email.labels.clone();
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_owned());
        }
        self.store.update_email_flags(
            message_id,
            &EmailFlagsUpdate {
                labels: Some(labels),
                ..Default::default()
            },
        )
    }

    pub async fn remove_label(&self, message_id: &str, label: &str) -> AppResult<()> {
        let query = format!("-X-GM-LABELS.SILENT ({})", quote_label(label));
        self.toggle_flag(message_id, &query).await?;
        let email = self.require_email(message_id)?;
        let labels = email.labels.into_iter().filter(|l| l != label).collect();
        self.store.update_email_flags(
            message_id,
            &EmailFlagsUpdate {
                labels: Some(labels),
                ..Default::default()
            },
        )
    }

    pub async fn call_agent(&self, request: &AgentRequest) -> AppResult<Value> {
        self.agent.call(request).await
    }

    fn require_email(&self, message_id: &str) -> AppResult<crate::store::Email> {
        self.store
            .get_by_message_id(message_id)?
            .ok_or_else(|| AppError::NotFound(format!("no email with message_id '{message_id}'")))
    }

    async fn toggle_flag(&self, message_id: &str, store_query: &str) -> AppResult<()> {
        let email = self.require_email(message_id)?;
        let folder = email.folder.clone();
        let uid = email_uid(&email)?;
        let mut guard = self.imap.acquire().await?;
        let session = guard.as_mut().expect("acquire populates session");
        ops::select_mailbox(self.imap.config(), session, &folder, SelectMode::ReadWrite).await?;
        let result = ops::uid_store(self.imap.config(), session, uid, store_query).await;
        if result.is_err() {
            drop(guard);
            self.imap.invalidate().await;
        }
        result
    }

}

fn email_uid(email: &crate::store::Email) -> AppResult<u32> {
    email
        .uid
        .ok_or_else(|| AppError::NotFound(format!("email {} has no server uid", email.message_id)))
}

fn quote_label(label: &str) -> String {
    format!("\"{}\"", label.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Dispatches events to every registered, matching listener
///
/// `check_event` never raises (spec.md §8 invariant): a throwing handler is
/// caught, logged with the listener id, and dispatch continues with the
/// next handler.
pub struct Dispatcher {
    registry: Arc<ListenerRegistry>,
    context_factory: Arc<ContextFactory>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ListenerRegistry>, context_factory: Arc<ContextFactory>) -> Self {
        Self {
            registry,
            context_factory,
        }
    }

    pub async fn check_event(&self, kind: EventKind, payload: EventPayload) {
        for module in self.registry.matching(kind) {
            let listener_id = module.config.id.clone();
            if let Err(err) = self.invoke(&module, &payload).await {
                error!(listener_id = %listener_id, error = %err, "listener handler failed");
            }
        }
    }

    async fn invoke(&self, module: &ListenerModule, payload: &EventPayload) -> AppResult<()> {
        let email = match payload.message_id() {
            Some(message_id) => self.context_factory.store.get_by_message_id(message_id)?,
            None => None,
        };

        if !matches_condition(&module.when, email.as_ref()) {
            return Ok(());
        }

        let context = self
            .context_factory
            .build(module.config.id.clone(), module.config.name.clone());
        let mut agent_result: Option<Value> = None;

        run_actions(&module.then, &context, payload, email.as_ref(), &mut agent_result)
            .await
            .map_err(|e| AppError::from_listener(module.config.id.clone(), e))?;
        info!(listener_id = %module.config.id, "listener dispatched");
        Ok(())
    }
}

fn matches_condition(condition: &Condition, email: Option<&crate::store::Email>) -> bool {
    let Some(email) = email else {
        return condition.from_contains.is_none()
            && condition.to_contains.is_none()
            && condition.subject_contains.is_none()
            && condition.is_unread.is_none()
            && condition.has_attachments.is_none()
            && condition.folder_equals.is_none()
            && condition.label_equals.is_none();
    };

    if let Some(needle) = &condition.from_contains
        && !email.from_address.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
    {
        return false;
    }
    if let Some(needle) = &condition.to_contains
        && !email.to_raw.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
    {
        return false;
    }
    if let Some(needle) = &condition.subject_contains
        && !email.subject.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
    {
        return false;
    }
    if let Some(expected) = condition.is_unread
        && (!email.flags.is_read) != expected
    {
        return false;
    }
    if let Some(expected) = condition.has_attachments
        && (email.attachment_count > 0) != expected
    {
        return false;
    }
    if let Some(folder) = &condition.folder_equals
        && &email.folder != folder
    {
        return false;
    }
    if let Some(label) = &condition.label_equals
        && !email.labels.iter().any(|l| l == label)
    {
        return false;
    }
    true
}

fn run_actions<'a>(
    actions: &'a [Action],
    context: &'a Context<'a>,
    payload: &'a EventPayload,
    email: Option<&'a crate::store::Email>,
    agent_result: &'a mut Option<Value>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = AppResult<()>> + 'a>> {
    Box::pin(async move {
        for action in actions {
            run_action(action, context, payload, email, agent_result).await?;
        }
        Ok(())
    })
}

async fn run_action(
    action: &Action,
    context: &Context<'_>,
    payload: &EventPayload,
    email: Option<&crate::store::Email>,
    agent_result: &mut Option<Value>,
) -> AppResult<()> {
    let message_id = payload.message_id().map(str::to_owned);

    match action {
        Action::Notify {
            message_template,
            priority,
        } => {
            let message = render_template(message_template, email, agent_result.as_ref());
            context.notify(message, *priority, message_id);
        }
        Action::Archive => {
            if let Some(id) = &message_id {
                context.archive_email(id).await?;
            }
        }
        Action::Star => {
            if let Some(id) = &message_id {
                context.star_email(id).await?;
            }
        }
        Action::Unstar => {
            if let Some(id) = &message_id {
                context.unstar_email(id).await?;
            }
        }
        Action::MarkAsRead => {
            if let Some(id) = &message_id {
                context.mark_as_read(id).await?;
            }
        }
        Action::MarkAsUnread => {
            if let Some(id) = &message_id {
                context.mark_as_unread(id).await?;
            }
        }
        Action::AddLabel { label } => {
            if let Some(id) = &message_id {
                context.add_label(id, label).await?;
            }
        }
        Action::RemoveLabel { label } => {
            if let Some(id) = &message_id {
                context.remove_label(id, label).await?;
            }
        }
        Action::CallAgent { prompt, schema, model } => {
            let request = AgentRequest {
                prompt: render_template(prompt, email, agent_result.as_ref()),
                schema: schema.clone(),
                model: crate::listeners::Action::model_alias(model),
            };
            *agent_result = Some(context.call_agent(&request).await?);
        }
        Action::IfAgent { field, equals, then } => {
            let matches = agent_result
                .as_ref()
                .and_then(|v| v.get(field))
                .map(|v| v == equals)
                .unwrap_or(false);
            if matches {
                run_actions(then, context, payload, email, agent_result).await?;
            } else {
                warn!(field = %field, "if_agent condition did not match, skipping branch");
            }
        }
    }
    Ok(())
}

/// Substitute `{field}` placeholders, preferring the most recent
/// `call_agent` result and falling back to the triggering email's own
/// fields (`subject`, `from`, `folder`); unknown placeholders are left as-is
fn render_template(template: &str, email: Option<&crate::store::Email>, agent_result: Option<&Value>) -> String {
    let mut rendered = template.to_owned();

    if let Some(email) = email {
        rendered = rendered.replace("{subject}", &email.subject);
        rendered = rendered.replace("{from}", &email.from_address);
        rendered = rendered.replace("{folder}", &email.folder);
    }

    let Some(object) = agent_result.and_then(Value::as_object) else {
        return rendered;
    };
    for (key, value) in object {
        let placeholder = format!("{{{key}}}");
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &replacement);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_template_substitutes_agent_fields() {
        let result = serde_json::json!({ "reason": "production outage" });
        let rendered = render_template("Urgent: {reason}", None, Some(&result));
        assert_eq!(rendered, "Urgent: production outage");
    }

    #[test]
    fn render_template_without_agent_result_is_passthrough() {
        assert_eq!(render_template("Hello {name}", None, None), "Hello {name}");
    }

    #[test]
    fn render_template_substitutes_email_subject() {
        let email = sample_email();
        let rendered = render_template("Auto-archived newsletter: {subject}", Some(&email), None);
        assert_eq!(rendered, format!("Auto-archived newsletter: {}", email.subject));
    }

    #[test]
    fn matches_condition_checks_from_contains_case_insensitively() {
        let condition = Condition {
            from_contains: Some("NOREPLY".to_owned()),
            ..Default::default()
        };
        let mut email = sample_email();
        email.from_address = "news@noreply.site".to_owned();
        assert!(matches_condition(&condition, Some(&email)));
    }

    fn sample_email() -> crate::store::Email {
        crate::store::Email {
            id: 1,
            message_id: "<a@x>".to_owned(),
            uid: Some(1),
            thread_id: None,
            in_reply_to: None,
            references: Vec::new(),
            date_sent: None,
            date_received: None,
            subject: String::new(),
            from_address: String::new(),
            from_name: None,
            to_raw: String::new(),
            cc_raw: String::new(),
            bcc_raw: String::new(),
            recipients: Vec::new(),
            body_text: None,
            body_html: None,
            snippet: String::new(),
            flags: crate::store::EmailFlags::default(),
            folder: "INBOX".to_owned(),
            labels: Vec::new(),
            size_bytes: 0,
            attachment_count: 0,
            attachments: Vec::new(),
            raw_headers: String::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }
}
