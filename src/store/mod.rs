//! Mail Store (C1 in spec.md): durable, queryable mailbox mirror
//!
//! Single-writer model backed by SQLite's write-ahead log (spec.md §4.1
//! "Concurrency & integrity"). Readers are lock-free; all multi-statement
//! writes (email + recipients + attachments + FTS) run in one transaction so
//! a failure rolls the entire batch back.

mod models;
mod schema;

pub use models::{
    Attachment, DateRange, Email, EmailFlags, EmailFlagsUpdate, Recipient, RecipientType,
    SearchCriteria, StoreStatistics, SyncMetadataRow, SyncType,
};

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::{AppError, AppResult};

/// Durable, indexed mailbox mirror
///
/// Wraps a single `rusqlite::Connection` behind a mutex. SQLite's own
/// locking makes cross-process concurrency safe; the in-process mutex
/// serializes the handful of multi-statement transactions this store issues
/// so two upserts of the same message-id never interleave (spec.md §4.1:
/// "last writer wins").
pub struct MailStore {
    conn: Mutex<Connection>,
}

impl MailStore {
    /// Open (or create) the store at `path` and ensure the schema exists
    pub fn open(path: &Path) -> AppResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| AppError::Store(format!("failed to open database: {e}")))?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests and by one-shot CLI invocations
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Store(format!("failed to open in-memory database: {e}")))?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or update an email by message-id, replacing its recipients and
    /// attachments, and keeping the FTS index consistent — all in one
    /// transaction (spec.md §4.1 `upsertEmail`).
    ///
    /// Returns the row's integer surrogate key.
    pub fn upsert_email(&self, email: &Email) -> AppResult<i64> {
        let mut conn = self.conn.lock().expect("mail store mutex poisoned");
        let tx = conn.transaction()?;

        let existing_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM emails WHERE message_id = ?1",
                params![email.message_id],
                |row| row.get(0),
            )
            .optional()?;

        let references_json = serde_json::to_string(&email.references)
            .map_err(|e| AppError::Internal(format!("failed to encode references: {e}")))?;
        let labels_json = serde_json::to_string(&email.labels)
            .map_err(|e| AppError::Internal(format!("failed to encode labels: {e}")))?;
        let now = Utc::now();

        let email_id = if let Some(id) = existing_id {
            tx.execute(
                "UPDATE emails SET
                    uid = ?1, thread_id = ?2, in_reply_to = ?3, references_json = ?4,
                    date_sent = ?5, date_received = ?6, subject = ?7, from_address = ?8,
                    from_name = ?9, to_raw = ?10, cc_raw = ?11, bcc_raw = ?12,
                    body_text = ?13, body_html = ?14, snippet = ?15,
                    is_read = ?16, is_starred = ?17, is_important = ?18, is_draft = ?19,
                    is_sent = ?20, is_trash = ?21, is_spam = ?22, folder = ?23,
                    labels_json = ?24, size_bytes = ?25, attachment_count = ?26,
                    raw_headers = ?27, updated_at = ?28
                 WHERE id = ?29",
                params![
                    email.uid,
                    email.thread_id,
                    email.in_reply_to,
                    references_json,
                    email.date_sent.map(|d| d.to_rfc3339()),
                    email.date_received.map(|d| d.to_rfc3339()),
                    email.subject,
                    email.from_address,
                    email.from_name,
                    email.to_raw,
                    email.cc_raw,
                    email.bcc_raw,
                    email.body_text,
                    email.body_html,
                    email.snippet,
                    email.flags.is_read,
                    email.flags.is_starred,
                    email.flags.is_important,
                    email.flags.is_draft,
                    email.flags.is_sent,
                    email.flags.is_trash,
                    email.flags.is_spam,
                    email.folder,
                    labels_json,
                    email.size_bytes,
                    email.attachment_count,
                    email.raw_headers,
                    now.to_rfc3339(),
                    id,
                ],
            )?;
            tx.execute("DELETE FROM recipients WHERE email_id = ?1", params![id])?;
            tx.execute("DELETE FROM attachments WHERE email_id = ?1", params![id])?;
            id
        } else {
            tx.execute(
                "INSERT INTO emails (
                    message_id, uid, thread_id, in_reply_to, references_json,
                    date_sent, date_received, subject, from_address, from_name,
                    to_raw, cc_raw, bcc_raw, body_text, body_html, snippet,
                    is_read, is_starred, is_important, is_draft, is_sent, is_trash, is_spam,
                    folder, labels_json, size_bytes, attachment_count, raw_headers,
                    created_at, updated_at
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29
                 )",
                params![
                    email.message_id,
                    email.uid,
                    email.thread_id,
                    email.in_reply_to,
                    references_json,
                    email.date_sent.map(|d| d.to_rfc3339()),
                    email.date_received.map(|d| d.to_rfc3339()),
                    email.subject,
                    email.from_address,
                    email.from_name,
                    email.to_raw,
                    email.cc_raw,
                    email.bcc_raw,
                    email.body_text,
                    email.body_html,
                    email.snippet,
                    email.flags.is_read,
                    email.flags.is_starred,
                    email.flags.is_important,
                    email.flags.is_draft,
                    email.flags.is_sent,
                    email.flags.is_trash,
                    email.flags.is_spam,
                    email.folder,
                    labels_json,
                    email.size_bytes,
                    email.attachment_count,
                    email.raw_headers,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;
            tx.last_insert_rowid()
        };

        for recipient in &email.recipients {
            tx.execute(
                "INSERT INTO recipients (email_id, recipient_type, address, display_name, domain)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    email_id,
                    recipient.recipient_type.as_str(),
                    recipient.address,
                    recipient.display_name,
                    recipient.domain,
                ],
            )?;
        }

        for attachment in &email.attachments {
            let extension = attachment.extension();
            tx.execute(
                "INSERT INTO attachments (email_id, filename, mime_type, size_bytes, content_id, inline, extension)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    email_id,
                    attachment.filename,
                    attachment.mime_type,
                    attachment.size_bytes,
                    attachment.content_id,
                    attachment.inline,
                    extension,
                ],
            )?;
        }

        let recipient_addresses = email
            .recipients
            .iter()
            .map(|r| r.address.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let attachment_filenames = email
            .attachments
            .iter()
            .filter_map(|a| a.filename.as_deref())
            .collect::<Vec<_>>()
            .join(" ");
        let body = email.body_text.as_deref().unwrap_or_default();

        tx.execute("DELETE FROM emails_fts WHERE rowid = ?1", params![email_id])?;
        tx.execute(
            "INSERT INTO emails_fts
                (rowid, message_id, subject, from_address, from_name, body, recipient_addresses, attachment_filenames)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                email_id,
                email.message_id,
                email.subject,
                email.from_address,
                email.from_name,
                body,
                recipient_addresses,
                attachment_filenames,
            ],
        )?;

        tx.commit()?;
        Ok(email_id)
    }

    /// Look up an email by message-id, including its recipients and
    /// attachments. Used by the Dispatcher to resolve a listener-visible id
    /// to a UID before IMAP operations.
    pub fn get_by_message_id(&self, message_id: &str) -> AppResult<Option<Email>> {
        let conn = self.conn.lock().expect("mail store mutex poisoned");
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM emails WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => Ok(Some(load_email(&conn, id)?)),
            None => Ok(None),
        }
    }

    /// Look up emails by message-id, ordered by send-date descending
    pub fn get_by_message_ids(&self, message_ids: &[String]) -> AppResult<Vec<Email>> {
        let conn = self.conn.lock().expect("mail store mutex poisoned");
        let mut emails = Vec::with_capacity(message_ids.len());
        for message_id in message_ids {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM emails WHERE message_id = ?1",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = id {
                emails.push(load_email(&conn, id)?);
            }
        }
        emails.sort_by(|a, b| b.date_sent.cmp(&a.date_sent));
        Ok(emails)
    }

    /// Search emails by the recognized criteria (spec.md §4.1 `searchEmails`),
    /// ordered by send-date descending and paginated via `(limit, offset)`.
    pub fn search_emails(&self, criteria: &SearchCriteria) -> AppResult<Vec<Email>> {
        if criteria.limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("mail store mutex poisoned");

        let mut clauses: Vec<String> = Vec::new();
        let mut fts_match: Option<String> = None;

        if let Some(query) = &criteria.query
            && !query.trim().is_empty()
        {
            fts_match = Some(query.clone());
        }

        if !criteria.from.is_empty() {
            let ors = criteria
                .from
                .iter()
                .map(|_| "from_address LIKE ?".to_owned())
                .collect::<Vec<_>>()
                .join(" OR ");
            clauses.push(format!("({ors})"));
        }
        if !criteria.to.is_empty() {
            let ors = criteria
                .to
                .iter()
                .map(|_| {
                    "id IN (SELECT email_id FROM recipients WHERE recipient_type = 'to' AND address LIKE ?)"
                        .to_owned()
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            clauses.push(format!("({ors})"));
        }
        if criteria.subject.is_some() {
            clauses.push("subject LIKE ?".to_owned());
        }
        if let Some(range) = &criteria.date_range {
            if range.since.is_some() {
                clauses.push("date_sent >= ?".to_owned());
            }
            if range.before.is_some() {
                clauses.push("date_sent <= ?".to_owned());
            }
        }
        if criteria.has_attachments == Some(true) {
            clauses.push("attachment_count > 0".to_owned());
        } else if criteria.has_attachments == Some(false) {
            clauses.push("attachment_count = 0".to_owned());
        }
        if let Some(unread) = criteria.is_unread {
            clauses.push(format!("is_read = {}", i32::from(!unread)));
        }
        if let Some(starred) = criteria.is_starred {
            clauses.push(format!("is_starred = {}", i32::from(starred)));
        }
        if !criteria.folders.is_empty() {
            let ors = criteria
                .folders
                .iter()
                .map(|_| "folder = ?".to_owned())
                .collect::<Vec<_>>()
                .join(" OR ");
            clauses.push(format!("({ors})"));
        }
        if criteria.thread_id.is_some() {
            clauses.push("thread_id = ?".to_owned());
        }
        if criteria.min_size.is_some() {
            clauses.push("size_bytes >= ?".to_owned());
        }
        if criteria.max_size.is_some() {
            clauses.push("size_bytes <= ?".to_owned());
        }
        for _ in &criteria.labels {
            clauses.push("labels_json LIKE ?".to_owned());
        }

        let mut sql = if fts_match.is_some() {
            "SELECT e.* FROM emails e JOIN emails_fts f ON f.rowid = e.id WHERE f.emails_fts MATCH ?"
                .to_owned()
        } else {
            "SELECT * FROM emails e WHERE 1=1".to_owned()
        };
        for clause in &clauses {
            sql.push_str(" AND ");
            sql.push_str(clause);
        }
        sql.push_str(" ORDER BY date_sent DESC LIMIT ? OFFSET ?");

        let mut stmt = conn.prepare(&sql)?;
        let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(q) = &fts_match {
            param_values.push(Box::new(q.clone()));
        }
        for addr in &criteria.from {
            param_values.push(Box::new(format!("%{addr}%")));
        }
        for addr in &criteria.to {
            param_values.push(Box::new(format!("%{addr}%")));
        }
        if let Some(subject) = &criteria.subject {
            param_values.push(Box::new(format!("%{subject}%")));
        }
        if let Some(range) = &criteria.date_range {
            if let Some(since) = range.since {
                param_values.push(Box::new(since.to_rfc3339()));
            }
            if let Some(before) = range.before {
                param_values.push(Box::new(before.to_rfc3339()));
            }
        }
        for folder in &criteria.folders {
            param_values.push(Box::new(folder.clone()));
        }
        if let Some(thread_id) = &criteria.thread_id {
            param_values.push(Box::new(thread_id.clone()));
        }
        if let Some(min_size) = criteria.min_size {
            param_values.push(Box::new(min_size));
        }
        if let Some(max_size) = criteria.max_size {
            param_values.push(Box::new(max_size));
        }
        for label in &criteria.labels {
            param_values.push(Box::new(format!("%\"{label}\"%")));
        }
        param_values.push(Box::new(criteria.limit as i64));
        param_values.push(Box::new(criteria.offset as i64));

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            param_values.iter().map(|v| v.as_ref()).collect();

        let ids: Vec<i64> = stmt
            .query_map(params_refs.as_slice(), |row| row.get::<_, i64>("id"))?
            .collect::<Result<_, _>>()?;

        ids.into_iter().map(|id| load_email(&conn, id)).collect()
    }

    /// Newest-first convenience list for INBOX/All Mail (spec.md §4.1
    /// `recentEmails`)
    pub fn recent_emails(&self, limit: usize, include_read: bool) -> AppResult<Vec<Email>> {
        let mut criteria = SearchCriteria::with_defaults();
        criteria.limit = limit;
        if !include_read {
            criteria.is_unread = Some(true);
        }
        self.search_emails(&criteria)
    }

    /// Apply only the provided fields; touches `updated_at`. This is the
    /// single local write path for post-upsert mutation (spec.md §4.1).
    pub fn update_email_flags(
        &self,
        message_id: &str,
        update: &EmailFlagsUpdate,
    ) -> AppResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().expect("mail store mutex poisoned");
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(is_read) = update.is_read {
            sets.push("is_read = ?".to_owned());
            values.push(Box::new(is_read));
        }
        if let Some(is_starred) = update.is_starred {
            sets.push("is_starred = ?".to_owned());
            values.push(Box::new(is_starred));
        }
        if let Some(is_important) = update.is_important {
            sets.push("is_important = ?".to_owned());
            values.push(Box::new(is_important));
        }
        if let Some(labels) = &update.labels {
            let labels_json = serde_json::to_string(labels)
                .map_err(|e| AppError::Internal(format!("failed to encode labels: {e}")))?;
            sets.push("labels_json = ?".to_owned());
            values.push(Box::new(labels_json));
        }
        if let Some(folder) = &update.folder {
            sets.push("folder = ?".to_owned());
            values.push(Box::new(folder.clone()));
        }
        if let Some(uid) = update.uid {
            sets.push("uid = ?".to_owned());
            values.push(Box::new(uid));
        }
        sets.push("updated_at = ?".to_owned());
        values.push(Box::new(Utc::now().to_rfc3339()));
        values.push(Box::new(message_id.to_owned()));

        let sql = format!(
            "UPDATE emails SET {} WHERE message_id = ?",
            sets.join(", ")
        );
        let params_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let affected = conn.execute(&sql, params_refs.as_slice())?;
        if affected == 0 {
            return Err(AppError::NotFound(format!(
                "no email with message_id '{message_id}'"
            )));
        }
        Ok(())
    }

    /// Aggregate counts for observability
    pub fn statistics(&self) -> AppResult<StoreStatistics> {
        let conn = self.conn.lock().expect("mail store mutex poisoned");
        let total_emails: i64 =
            conn.query_row("SELECT COUNT(*) FROM emails", [], |row| row.get(0))?;
        let unread_emails: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE is_read = 0",
            [],
            |row| row.get(0),
        )?;
        let starred_emails: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE is_starred = 1",
            [],
            |row| row.get(0),
        )?;
        let total_attachments: i64 =
            conn.query_row("SELECT COUNT(*) FROM attachments", [], |row| row.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT folder, COUNT(*) FROM emails GROUP BY folder ORDER BY COUNT(*) DESC",
        )?;
        let folders = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreStatistics {
            total_emails,
            unread_emails,
            starred_emails,
            total_attachments,
            folders,
        })
    }

    /// Append a row to the monotonic sync-run log (spec.md §3 "Sync metadata")
    pub fn record_sync_run(
        &self,
        synced: i64,
        skipped: i64,
        errors: i64,
        sync_type: SyncType,
    ) -> AppResult<()> {
        let conn = self.conn.lock().expect("mail store mutex poisoned");
        conn.execute(
            "INSERT INTO sync_metadata (timestamp, emails_synced, emails_skipped, errors, sync_type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Utc::now().to_rfc3339(), synced, skipped, errors, sync_type.as_str()],
        )?;
        Ok(())
    }

    /// Most recent sync run, used by `/api/sync/status`
    pub fn last_sync_run(&self) -> AppResult<Option<SyncMetadataRow>> {
        let conn = self.conn.lock().expect("mail store mutex poisoned");
        conn.query_row(
            "SELECT timestamp, emails_synced, emails_skipped, errors, sync_type
             FROM sync_metadata ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                let timestamp: String = row.get(0)?;
                let sync_type: String = row.get(4)?;
                Ok(SyncMetadataRow {
                    timestamp: parse_rfc3339(&timestamp),
                    emails_synced: row.get(1)?,
                    emails_skipped: row.get(2)?,
                    errors: row.get(3)?,
                    sync_type: match sync_type.as_str() {
                        "idle" => SyncType::Idle,
                        "scheduled" => SyncType::Scheduled,
                        _ => SyncType::Manual,
                    },
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    /// `MAX(date_sent)` across the store, used by `SyncService::sync_new`
    /// for incremental `since` computation
    pub fn max_date_sent(&self) -> AppResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().expect("mail store mutex poisoned");
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(date_sent) FROM emails",
            [],
            |row| row.get(0),
        )?;
        Ok(raw.map(|v| parse_rfc3339(&v)))
    }
}

fn parse_rfc3339(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Load a full `Email` (with recipients and attachments) by surrogate id
fn load_email(conn: &Connection, id: i64) -> AppResult<Email> {
    let mut email = conn.query_row(
        "SELECT id, message_id, uid, thread_id, in_reply_to, references_json,
                date_sent, date_received, subject, from_address, from_name,
                to_raw, cc_raw, bcc_raw, body_text, body_html, snippet,
                is_read, is_starred, is_important, is_draft, is_sent, is_trash, is_spam,
                folder, labels_json, size_bytes, attachment_count, raw_headers,
                created_at, updated_at
         FROM emails WHERE id = ?1",
        params![id],
        row_to_email,
    )?;

    let mut stmt = conn.prepare(
        "SELECT recipient_type, address, display_name, domain FROM recipients WHERE email_id = ?1",
    )?;
    let recipients = stmt
        .query_map(params![id], |row| {
            let recipient_type: String = row.get(0)?;
            Ok(Recipient {
                recipient_type: RecipientType::parse(&recipient_type).unwrap_or(RecipientType::To),
                address: row.get(1)?,
                display_name: row.get(2)?,
                domain: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT filename, mime_type, size_bytes, content_id, inline FROM attachments WHERE email_id = ?1",
    )?;
    let attachments = stmt
        .query_map(params![id], |row| {
            Ok(Attachment {
                filename: row.get(0)?,
                mime_type: row.get(1)?,
                size_bytes: row.get(2)?,
                content_id: row.get(3)?,
                inline: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    email.recipients = recipients;
    email.attachments = attachments;
    Ok(email)
}

fn row_to_email(row: &rusqlite::Row) -> rusqlite::Result<Email> {
    let references_json: String = row.get("references_json")?;
    let labels_json: String = row.get("labels_json")?;
    let date_sent: Option<String> = row.get("date_sent")?;
    let date_received: Option<String> = row.get("date_received")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Email {
        id: row.get("id")?,
        message_id: row.get("message_id")?,
        uid: row.get::<_, Option<i64>>("uid")?.map(|v| v as u32),
        thread_id: row.get("thread_id")?,
        in_reply_to: row.get("in_reply_to")?,
        references: serde_json::from_str(&references_json).unwrap_or_default(),
        date_sent: date_sent.map(|v| parse_rfc3339(&v)),
        date_received: date_received.map(|v| parse_rfc3339(&v)),
        subject: row.get("subject")?,
        from_address: row.get("from_address")?,
        from_name: row.get("from_name")?,
        to_raw: row.get("to_raw")?,
        cc_raw: row.get("cc_raw")?,
        bcc_raw: row.get("bcc_raw")?,
        recipients: Vec::new(),
        body_text: row.get("body_text")?,
        body_html: row.get("body_html")?,
        snippet: row.get("snippet")?,
        flags: EmailFlags {
            is_read: row.get("is_read")?,
            is_starred: row.get("is_starred")?,
            is_important: row.get("is_important")?,
            is_draft: row.get("is_draft")?,
            is_sent: row.get("is_sent")?,
            is_trash: row.get("is_trash")?,
            is_spam: row.get("is_spam")?,
        },
        folder: row.get("folder")?,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        size_bytes: row.get("size_bytes")?,
        attachment_count: row.get("attachment_count")?,
        attachments: Vec::new(),
        raw_headers: row.get("raw_headers")?,
        created_at: parse_rfc3339(&created_at),
        updated_at: parse_rfc3339(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_email(message_id: &str, subject: &str) -> Email {
        Email {
            id: 0,
            message_id: message_id.to_owned(),
            uid: Some(1),
            thread_id: None,
            in_reply_to: None,
            references: Vec::new(),
            date_sent: Some(Utc::now()),
            date_received: Some(Utc::now()),
            subject: subject.to_owned(),
            from_address: "sender@example.com".to_owned(),
            from_name: Some("Sender".to_owned()),
            to_raw: "user@example.com".to_owned(),
            cc_raw: String::new(),
            bcc_raw: String::new(),
            recipients: vec![Recipient::new(
                RecipientType::To,
                "user@example.com",
                None,
            )],
            body_text: Some("Hello there".to_owned()),
            body_html: None,
            snippet: "Hello there".to_owned(),
            flags: EmailFlags::default(),
            folder: "INBOX".to_owned(),
            labels: Vec::new(),
            size_bytes: 100,
            attachment_count: 0,
            attachments: Vec::new(),
            raw_headers: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_then_get_by_message_id_round_trips() {
        let store = MailStore::open_in_memory().unwrap();
        let email = sample_email("<a@x>", "Hello World");
        store.upsert_email(&email).unwrap();

        let loaded = store.get_by_message_id("<a@x>").unwrap().unwrap();
        assert_eq!(loaded.subject, "Hello World");
        assert_eq!(loaded.from_address, "sender@example.com");
        assert_eq!(loaded.recipients.len(), 1);
    }

    #[test]
    fn upsert_is_idempotent_on_message_id() {
        let store = MailStore::open_in_memory().unwrap();
        let email = sample_email("<dup@x>", "First Subject");
        let id1 = store.upsert_email(&email).unwrap();

        let mut updated = email.clone();
        updated.subject = "Second Subject".to_owned();
        let id2 = store.upsert_email(&updated).unwrap();

        assert_eq!(id1, id2);
        let loaded = store.get_by_message_id("<dup@x>").unwrap().unwrap();
        assert_eq!(loaded.subject, "Second Subject");

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_emails, 1);
    }

    #[test]
    fn fts_search_finds_unique_subject_token() {
        let store = MailStore::open_in_memory().unwrap();
        store
            .upsert_email(&sample_email("<fts@x>", "Quarterly Zorbflux Report"))
            .unwrap();

        let mut criteria = SearchCriteria::with_defaults();
        criteria.query = Some("Zorbflux".to_owned());
        let results = store.search_emails(&criteria).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message_id, "<fts@x>");
    }

    #[test]
    fn update_email_flags_applies_only_provided_fields() {
        let store = MailStore::open_in_memory().unwrap();
        store.upsert_email(&sample_email("<flags@x>", "Subj")).unwrap();

        store
            .update_email_flags(
                "<flags@x>",
                &EmailFlagsUpdate {
                    is_starred: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        let loaded = store.get_by_message_id("<flags@x>").unwrap().unwrap();
        assert!(loaded.flags.is_starred);
        assert!(!loaded.flags.is_read);
    }

    #[test]
    fn update_email_flags_errors_on_missing_message() {
        let store = MailStore::open_in_memory().unwrap();
        let result = store.update_email_flags(
            "<missing@x>",
            &EmailFlagsUpdate {
                is_read: Some(true),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn search_limit_zero_returns_empty() {
        let store = MailStore::open_in_memory().unwrap();
        store.upsert_email(&sample_email("<z@x>", "Subj")).unwrap();
        let mut criteria = SearchCriteria::with_defaults();
        criteria.limit = 0;
        assert!(store.search_emails(&criteria).unwrap().is_empty());
    }
}
