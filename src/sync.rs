//! Sync Service (C3): drives incremental and filtered syncs (spec.md §4.3)

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};

use crate::dispatcher::{Dispatcher, EventPayload};
use crate::errors::AppResult;
use crate::imap::{ImapClient, ops, ops::SelectMode};
use crate::listeners::EventKind;
use crate::mime;
use crate::store::{Email, EmailFlags, MailStore, SearchCriteria, SyncType};

/// Size cap a single fetched message may not exceed (spec.md §4.2 "Fetch":
/// "size-capped at 50 MB during streaming and rejected if exceeded")
const MAX_MESSAGE_BYTES: usize = 50 * 1024 * 1024;

/// Default lookback window when `since` is omitted (spec.md §4.3)
const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// A single sync request (spec.md §4.3 "Inputs (SyncOptions)")
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub folder: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub unread_only: bool,
    pub starred_only: bool,
    pub has_attachments: Option<bool>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub query: Option<String>,
    pub limit: usize,
    /// Typed but unused (spec.md §9 Open Questions: semantics undefined in
    /// the source this was distilled from; carried for wire compatibility
    /// with the SyncOptions shape only)
    pub exclude_folders: Vec<String>,
}

impl SyncOptions {
    pub fn folder_or_default(&self) -> &str {
        self.folder.as_deref().unwrap_or("INBOX")
    }
}

/// Per-run outcome counters (spec.md §3 "Sync metadata")
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SyncReport {
    pub synced: i64,
    pub skipped: i64,
    pub errors: i64,
}

pub struct SyncService {
    store: Arc<MailStore>,
    imap: Arc<ImapClient>,
    dispatcher: Arc<Dispatcher>,
}

impl SyncService {
    pub fn new(store: Arc<MailStore>, imap: Arc<ImapClient>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            imap,
            dispatcher,
        }
    }

    /// Run a sync (spec.md §4.3 "Algorithm")
    ///
    /// Select folder → translate options into a server search → receive UID
    /// list → iterate (bounded by `limit`); for each UID, fetch, parse,
    /// dedup by message-id, optionally apply the post-fetch `hasAttachments`
    /// filter, upsert, and dispatch `email_received`.
    pub async fn sync(&self, options: &SyncOptions, sync_type: SyncType) -> AppResult<SyncReport> {
        let folder = options.folder_or_default().to_owned();
        let criteria = self.criteria_for(options);
        let query = ops::build_search_query(&criteria);

        let uids = {
            let mut guard = self.imap.acquire().await?;
            let session = guard.as_mut().expect("acquire populates session");
            let select_result =
                ops::select_mailbox(self.imap.config(), session, &folder, SelectMode::ReadOnly)
                    .await;
            if select_result.is_err() {
                drop(guard);
                self.imap.invalidate().await;
            }
            select_result?;
            let session = guard.as_mut().expect("acquire populates session");
            ops::uid_search(self.imap.config(), session, &query).await?
        };

        let limit = if options.limit == 0 { 30 } else { options.limit };
        let uids: Vec<u32> = uids.into_iter().take(limit).collect();

        let mut report = SyncReport::default();
        for chunk in uids.chunks(ops::DEFAULT_FETCH_BATCH_SIZE) {
            let fetched = {
                let mut guard = self.imap.acquire().await?;
                let session = guard.as_mut().expect("acquire populates session");
                match ops::fetch_raw_messages(self.imap.config(), session, chunk).await {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        drop(guard);
                        self.imap.invalidate().await;
                        warn!(error = %err, ?chunk, "sync: batch fetch failed, skipping chunk");
                        report.errors += chunk.len() as i64;
                        continue;
                    }
                }
            };

            // Any requested UID absent from the response (expunged between
            // search and fetch, or a malformed response dropped by
            // `ops::fetch_batch`) is an empty slot, not a hard error.
            let fetched_uids: std::collections::HashSet<u32> =
                fetched.iter().map(|(uid, _)| *uid).collect();
            report.skipped += chunk.iter().filter(|uid| !fetched_uids.contains(uid)).count() as i64;

            for (uid, raw) in fetched {
                match self.process_fetched(&folder, uid, &raw, options).await {
                    Ok(SyncOutcome::Synced) => report.synced += 1,
                    Ok(SyncOutcome::Skipped) => report.skipped += 1,
                    Ok(SyncOutcome::FilteredOut) => {}
                    Err(err) => {
                        warn!(uid, error = %err, "sync: failed to process message, continuing");
                        report.errors += 1;
                    }
                }
            }
        }

        self.store
            .record_sync_run(report.synced, report.skipped, report.errors, sync_type)?;
        info!(
            folder,
            synced = report.synced,
            skipped = report.skipped,
            errors = report.errors,
            "sync run complete"
        );
        Ok(report)
    }

    /// `syncNew()`: incremental sync from the store's watermark
    /// (spec.md §4.3 "Incremental sync")
    pub async fn sync_new(&self, folder: Option<String>) -> AppResult<SyncReport> {
        let since = self
            .store
            .max_date_sent()?
            .unwrap_or_else(|| Utc::now() - ChronoDuration::days(DEFAULT_LOOKBACK_DAYS));
        let options = SyncOptions {
            folder,
            since: Some(since),
            limit: 200,
            ..Default::default()
        };
        self.sync(&options, SyncType::Scheduled).await
    }

    /// IDLE-triggered resync (spec.md §4.3): absorbs a burst of `count`
    /// new messages with a small timing-skew cushion
    pub async fn sync_after_idle(&self, folder: &str, count: u32) -> AppResult<SyncReport> {
        let options = SyncOptions {
            folder: Some(folder.to_owned()),
            since: Some(Utc::now() - ChronoDuration::seconds(60)),
            limit: (count as usize) + 5,
            ..Default::default()
        };
        self.sync(&options, SyncType::Idle).await
    }

    fn criteria_for(&self, options: &SyncOptions) -> SearchCriteria {
        SearchCriteria {
            query: options.query.clone(),
            from: options.from.clone(),
            to: options.to.clone(),
            subject: options.subject.clone(),
            date_range: Some(crate::store::DateRange {
                since: options
                    .since
                    .or_else(|| Some(Utc::now() - ChronoDuration::days(DEFAULT_LOOKBACK_DAYS))),
                before: options.before,
            }),
            has_attachments: None, // confirmed post-fetch only, see process_fetched
            is_unread: options.unread_only.then_some(true),
            is_starred: options.starred_only.then_some(true),
            min_size: options.min_size,
            max_size: options.max_size,
            limit: options.limit.max(1),
            ..SearchCriteria::with_defaults()
        }
    }

    /// Process one already-fetched message (parse, dedup, filter, upsert,
    /// dispatch); the batch fetch itself happens in [`SyncService::sync`].
    async fn process_fetched(
        &self,
        folder: &str,
        uid: u32,
        raw: &[u8],
        options: &SyncOptions,
    ) -> AppResult<SyncOutcome> {
        if raw.len() > MAX_MESSAGE_BYTES {
            error!(uid, size = raw.len(), "message exceeds size cap, skipping");
            return Err(crate::errors::AppError::Internal(format!(
                "message uid {uid} exceeds the {MAX_MESSAGE_BYTES} byte cap"
            )));
        }

        let parsed = mime::parse_message(raw)?;

        if self.store.get_by_message_id(&parsed.message_id)?.is_some() {
            return Ok(SyncOutcome::Skipped);
        }

        if let Some(expected) = options.has_attachments
            && !parsed.attachments.is_empty() != expected
        {
            return Ok(SyncOutcome::FilteredOut);
        }

        let email = build_email_record(folder, uid, &parsed, raw.len());
        self.store.upsert_email(&email)?;

        self.dispatcher
            .check_event(
                EventKind::EmailReceived,
                EventPayload::Email {
                    message_id: email.message_id.clone(),
                },
            )
            .await;

        Ok(SyncOutcome::Synced)
    }
}

enum SyncOutcome {
    Synced,
    Skipped,
    FilteredOut,
}

fn build_email_record(folder: &str, uid: u32, parsed: &mime::ParsedMessage, size: usize) -> Email {
    let now = Utc::now();
    let date_sent = parsed
        .date
        .as_deref()
        .and_then(|d| chrono::DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.with_timezone(&Utc));

    Email {
        id: 0,
        message_id: parsed.message_id.clone(),
        uid: Some(uid),
        thread_id: parsed.thread_id.clone(),
        in_reply_to: parsed.in_reply_to.clone(),
        references: parsed.references.clone(),
        date_sent,
        date_received: Some(now),
        subject: parsed.subject.clone(),
        from_address: parsed.from_address.clone(),
        from_name: parsed.from_name.clone(),
        to_raw: parsed.to_raw.clone(),
        cc_raw: parsed.cc_raw.clone(),
        bcc_raw: parsed.bcc_raw.clone(),
        recipients: parsed.recipients.clone(),
        body_text: parsed.body_text.clone(),
        body_html: parsed.body_html_sanitized.clone(),
        snippet: parsed.snippet.clone(),
        flags: EmailFlags::default(),
        folder: folder.to_owned(),
        labels: Vec::new(),
        size_bytes: size as i64,
        attachment_count: parsed.attachments.len() as i64,
        attachments: parsed.attachments.clone(),
        raw_headers: parsed
            .headers_all
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\r\n"),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_email_record_carries_folder_uid_and_size() {
        let raw = b"From: sender@example.com\r\n\
Subject: Quarterly report\r\n\
Message-ID: <abc@example.com>\r\n\
Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
\r\n\
Body text.";
        let parsed = mime::parse_message(raw).unwrap();
        let email = build_email_record("INBOX", 42, &parsed, raw.len());

        assert_eq!(email.folder, "INBOX");
        assert_eq!(email.uid, Some(42));
        assert_eq!(email.message_id, "<abc@example.com>");
        assert_eq!(email.subject, "Quarterly report");
        assert_eq!(email.size_bytes, raw.len() as i64);
        assert!(email.date_sent.is_some());
    }

    #[test]
    fn build_email_record_tolerates_unparseable_date() {
        let raw = b"From: sender@example.com\r\n\
Subject: No date\r\n\
Message-ID: <nodate@example.com>\r\n\
\r\n\
Body.";
        let parsed = mime::parse_message(raw).unwrap();
        let email = build_email_record("INBOX", 1, &parsed, raw.len());
        assert!(email.date_sent.is_none());
    }
}
