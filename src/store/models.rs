//! Mail store domain types
//!
//! `Email` is the mirror record keyed by RFC Message-ID (see spec.md §3).
//! `Recipient` and `Attachment` are owned by an `Email` and cascade-deleted
//! with it. `SearchCriteria` is the query surface for `MailStore::search_emails`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recipient type within an email's envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    To,
    Cc,
    Bcc,
}

impl RecipientType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "to" => Some(Self::To),
            "cc" => Some(Self::Cc),
            "bcc" => Some(Self::Bcc),
            _ => None,
        }
    }
}

/// A single recipient on an email, owned by the parent `Email`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub recipient_type: RecipientType,
    /// Lowercased address
    pub address: String,
    pub display_name: Option<String>,
    /// Host part after `@`, lowercased
    pub domain: String,
}

impl Recipient {
    pub fn new(recipient_type: RecipientType, address: &str, display_name: Option<String>) -> Self {
        let address = address.trim().to_ascii_lowercase();
        let domain = address
            .rsplit_once('@')
            .map(|(_, host)| host.to_owned())
            .unwrap_or_default();
        Self {
            recipient_type,
            address,
            display_name,
            domain,
        }
    }
}

/// An attachment, owned by the parent `Email`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: Option<String>,
    pub mime_type: String,
    pub size_bytes: i64,
    pub content_id: Option<String>,
    pub inline: bool,
}

impl Attachment {
    /// Derived extension (lowercased, no leading dot); absent if `filename`
    /// has none
    pub fn extension(&self) -> Option<String> {
        self.filename
            .as_ref()
            .and_then(|f| f.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }
}

/// Independent boolean flags on an email
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EmailFlags {
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub is_draft: bool,
    pub is_sent: bool,
    pub is_trash: bool,
    pub is_spam: bool,
}

/// The mirror record for a single email (spec.md §3 "Email")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    /// Surrogate key assigned by the store; `0`/unset before the first upsert
    pub id: i64,
    /// RFC Message-ID; globally unique, primary key of the mirror
    pub message_id: String,
    /// Server UID, per-folder scope; absent for legacy rows
    pub uid: Option<u32>,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    /// Ordered reference chain (oldest first)
    pub references: Vec<String>,
    pub date_sent: Option<DateTime<Utc>>,
    pub date_received: Option<DateTime<Utc>>,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_raw: String,
    pub cc_raw: String,
    pub bcc_raw: String,
    pub recipients: Vec<Recipient>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// ≤ 200 chars
    pub snippet: String,
    pub flags: EmailFlags,
    pub folder: String,
    pub labels: Vec<String>,
    pub size_bytes: i64,
    pub attachment_count: i64,
    pub attachments: Vec<Attachment>,
    pub raw_headers: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a context operation or sync reconciliation may mutate via
/// `MailStore::update_email_flags`. Only `Some` fields are applied.
#[derive(Debug, Clone, Default)]
pub struct EmailFlagsUpdate {
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub is_important: Option<bool>,
    pub labels: Option<Vec<String>>,
    pub folder: Option<String>,
    /// New server UID, set after a folder move reassigns one
    /// (`Some(None)` is not representable here: the UID is only ever
    /// refreshed to a known value, never cleared).
    pub uid: Option<u32>,
}

impl EmailFlagsUpdate {
    pub fn is_empty(&self) -> bool {
        self.is_read.is_none()
            && self.is_starred.is_none()
            && self.is_important.is_none()
            && self.labels.is_none()
            && self.folder.is_none()
            && self.uid.is_none()
    }
}

/// Inclusive date range for `SearchCriteria::date_range`
#[derive(Debug, Clone)]
pub struct DateRange {
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

/// Search criteria for `MailStore::search_emails` (spec.md §4.1)
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub query: Option<String>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub date_range: Option<DateRange>,
    pub has_attachments: Option<bool>,
    pub is_unread: Option<bool>,
    pub is_starred: Option<bool>,
    pub folders: Vec<String>,
    pub thread_id: Option<String>,
    pub labels: Vec<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub limit: usize,
    pub offset: usize,
    /// When present, authoritative and passed via `X-GM-RAW`; all other
    /// fields on this struct are ignored by the IMAP translation layer.
    pub gmail_query: Option<String>,
}

impl SearchCriteria {
    /// Default limit (spec.md §4.1): 30
    pub fn with_defaults() -> Self {
        Self {
            limit: 30,
            ..Default::default()
        }
    }
}

/// One row of the `sync_metadata` observability log (spec.md §3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadataRow {
    pub timestamp: DateTime<Utc>,
    pub emails_synced: i64,
    pub emails_skipped: i64,
    pub errors: i64,
    pub sync_type: SyncType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Manual,
    Idle,
    Scheduled,
}

impl SyncType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Idle => "idle",
            Self::Scheduled => "scheduled",
        }
    }
}

/// Aggregate counts returned by `MailStore::statistics`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total_emails: i64,
    pub unread_emails: i64,
    pub starred_emails: i64,
    pub total_attachments: i64,
    pub folders: Vec<(String, i64)>,
}
