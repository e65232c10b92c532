//! SQLite schema for the mail store
//!
//! Write-ahead logging and foreign keys are enabled on every connection.
//! `emails_fts` is a regular FTS5 virtual table kept consistent with
//! `emails` by `MailStore::upsert_email`, which deletes and reinserts the
//! matching FTS row in the same transaction as the `emails` write
//! (spec.md §3 "Full-text index").

use rusqlite::Connection;

use crate::errors::AppResult;

/// Create all tables, indexes, the FTS5 virtual table, and its triggers if
/// they do not already exist. Idempotent; safe to call on every startup.
pub fn initialize(conn: &Connection) -> AppResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS emails (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id        TEXT NOT NULL UNIQUE,
            uid               INTEGER,
            thread_id         TEXT,
            in_reply_to       TEXT,
            references_json   TEXT NOT NULL DEFAULT '[]',
            date_sent         TEXT,
            date_received     TEXT,
            subject           TEXT NOT NULL DEFAULT '',
            from_address      TEXT NOT NULL DEFAULT '',
            from_name         TEXT,
            to_raw            TEXT NOT NULL DEFAULT '',
            cc_raw            TEXT NOT NULL DEFAULT '',
            bcc_raw           TEXT NOT NULL DEFAULT '',
            body_text         TEXT,
            body_html         TEXT,
            snippet           TEXT NOT NULL DEFAULT '',
            is_read           INTEGER NOT NULL DEFAULT 0,
            is_starred        INTEGER NOT NULL DEFAULT 0,
            is_important      INTEGER NOT NULL DEFAULT 0,
            is_draft          INTEGER NOT NULL DEFAULT 0,
            is_sent           INTEGER NOT NULL DEFAULT 0,
            is_trash          INTEGER NOT NULL DEFAULT 0,
            is_spam           INTEGER NOT NULL DEFAULT 0,
            folder            TEXT NOT NULL DEFAULT 'INBOX',
            labels_json       TEXT NOT NULL DEFAULT '[]',
            size_bytes        INTEGER NOT NULL DEFAULT 0,
            attachment_count  INTEGER NOT NULL DEFAULT 0,
            raw_headers       TEXT NOT NULL DEFAULT '',
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            UNIQUE(folder, uid)
        );

        CREATE INDEX IF NOT EXISTS idx_emails_date_sent    ON emails(date_sent DESC);
        CREATE INDEX IF NOT EXISTS idx_emails_from         ON emails(from_address);
        CREATE INDEX IF NOT EXISTS idx_emails_thread        ON emails(thread_id);
        CREATE INDEX IF NOT EXISTS idx_emails_message_id   ON emails(message_id);
        CREATE INDEX IF NOT EXISTS idx_emails_uid          ON emails(uid);
        CREATE INDEX IF NOT EXISTS idx_emails_read_starred ON emails(is_read, is_starred);
        CREATE INDEX IF NOT EXISTS idx_emails_folder       ON emails(folder);
        CREATE INDEX IF NOT EXISTS idx_emails_has_attach   ON emails(attachment_count);

        CREATE TABLE IF NOT EXISTS recipients (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id        INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            recipient_type  TEXT NOT NULL,
            address         TEXT NOT NULL,
            display_name    TEXT,
            domain          TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_recipients_email    ON recipients(email_id);
        CREATE INDEX IF NOT EXISTS idx_recipients_address  ON recipients(address);
        CREATE INDEX IF NOT EXISTS idx_recipients_domain   ON recipients(domain);
        CREATE INDEX IF NOT EXISTS idx_recipients_type     ON recipients(recipient_type);

        CREATE TABLE IF NOT EXISTS attachments (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id    INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            filename    TEXT,
            mime_type   TEXT NOT NULL DEFAULT 'application/octet-stream',
            size_bytes  INTEGER NOT NULL DEFAULT 0,
            content_id  TEXT,
            inline      INTEGER NOT NULL DEFAULT 0,
            extension   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_email     ON attachments(email_id);
        CREATE INDEX IF NOT EXISTS idx_attachments_extension ON attachments(extension);

        CREATE VIRTUAL TABLE IF NOT EXISTS emails_fts USING fts5(
            message_id UNINDEXED,
            subject,
            from_address,
            from_name,
            body,
            recipient_addresses,
            attachment_filenames,
            tokenize='porter unicode61'
        );

        CREATE TABLE IF NOT EXISTS sync_metadata (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp       TEXT NOT NULL,
            emails_synced   INTEGER NOT NULL DEFAULT 0,
            emails_skipped  INTEGER NOT NULL DEFAULT 0,
            errors          INTEGER NOT NULL DEFAULT 0,
            sync_type       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_metadata_timestamp ON sync_metadata(timestamp DESC);
        ",
    )?;

    Ok(())
}

