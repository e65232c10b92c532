//! Timeout-bounded IMAP session commands
//!
//! Adapted from the teacher's `imap.rs`: every command is wrapped in
//! `tokio::time::timeout` against the configured socket budget and mapped to
//! [`AppError`]. Generalized for UID-based search/fetch/mutation batches and
//! Gmail's `X-GM-RAW`/`X-GM-LABELS` search/store extensions instead of the
//! single-message operations the teacher exposed over MCP.

use std::time::Duration;

use async_imap::types::Fetch;
use futures::{StreamExt, TryStreamExt};
use tracing::warn;

use super::ImapSession;
use crate::config::EngineConfig;
use crate::errors::{AppError, AppResult};
use crate::store::SearchCriteria;

/// Default number of UIDs fetched per `UID FETCH` round-trip (spec.md §4.2
/// "Fetch"), capping memory use and request size for large sync windows.
pub const DEFAULT_FETCH_BATCH_SIZE: usize = 10;

fn socket_timeout(config: &EngineConfig) -> Duration {
    Duration::from_millis(config.socket_timeout_ms)
}

/// Whether a mailbox is opened for mutation (`SELECT`) or inspection only
/// (`EXAMINE`, never marks messages `\Seen`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
pub struct MailboxSelection {
    pub uid_validity: u32,
    pub exists: u32,
}

pub async fn select_mailbox(
    config: &EngineConfig,
    session: &mut ImapSession,
    mailbox: &str,
    mode: SelectMode,
) -> AppResult<MailboxSelection> {
    let mailbox_state = match mode {
        SelectMode::ReadOnly => timeout(config, session.examine(mailbox)).await?,
        SelectMode::ReadWrite => timeout(config, session.select(mailbox)).await?,
    }
    .map_err(|e| AppError::NotFound(format!("cannot open mailbox '{mailbox}': {e}")))?;

    Ok(MailboxSelection {
        uid_validity: mailbox_state
            .uid_validity
            .ok_or_else(|| AppError::Internal("mailbox missing UIDVALIDITY".to_owned()))?,
        exists: mailbox_state.exists,
    })
}

/// Translate [`SearchCriteria`] into a `UID SEARCH` query string
///
/// When `gmail_query` is present it is sent verbatim via `X-GM-RAW` and every
/// other field on `criteria` is ignored, matching spec.md §4.1's precedence
/// rule. Otherwise each recognized field becomes its own search key, ANDed
/// together (IMAP's default for multiple search keys).
pub fn build_search_query(criteria: &SearchCriteria) -> String {
    if let Some(raw) = &criteria.gmail_query {
        return format!("X-GM-RAW {}", quote(raw));
    }

    let mut terms = Vec::new();
    if let Some(query) = &criteria.query {
        terms.push(format!("TEXT {}", quote(query)));
    }
    for from in &criteria.from {
        terms.push(format!("FROM {}", quote(from)));
    }
    for to in &criteria.to {
        terms.push(format!("TO {}", quote(to)));
    }
    if let Some(subject) = &criteria.subject {
        terms.push(format!("SUBJECT {}", quote(subject)));
    }
    if let Some(range) = &criteria.date_range {
        if let Some(since) = range.since {
            terms.push(format!("SINCE {}", since.format("%d-%b-%Y")));
        }
        if let Some(before) = range.before {
            terms.push(format!("BEFORE {}", before.format("%d-%b-%Y")));
        }
    }
    match criteria.is_unread {
        Some(true) => terms.push("UNSEEN".to_owned()),
        Some(false) => terms.push("SEEN".to_owned()),
        None => {}
    }
    if criteria.is_starred == Some(true) {
        terms.push("FLAGGED".to_owned());
    }
    if terms.is_empty() {
        terms.push("ALL".to_owned());
    }
    terms.join(" ")
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub async fn uid_search(
    config: &EngineConfig,
    session: &mut ImapSession,
    query: &str,
) -> AppResult<Vec<u32>> {
    let set = timeout(config, session.uid_search(query))
        .await?
        .map_err(|e| AppError::Internal(format!("uid search failed: {e}")))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
}

/// Fetch a batch of UIDs in one `UID FETCH` round-trip
///
/// A malformed or failed individual response yields an empty slot rather
/// than aborting the whole batch (spec.md §4.2 "Fetch": "a per-message
/// failure yields an empty slot without aborting the batch") — each item is
/// collected as a `Result` and logged-and-skipped on error instead of using
/// `try_collect`, which would fail the entire batch on the first bad item.
async fn fetch_batch(
    config: &EngineConfig,
    session: &mut ImapSession,
    uids: &[u32],
    query: &str,
) -> AppResult<Vec<Fetch>> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    let uid_set = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let stream = timeout(config, session.uid_fetch(uid_set, query))
        .await?
        .map_err(|e| AppError::Internal(format!("uid fetch failed: {e}")))?;

    let results: Vec<Result<Fetch, _>> = timeout(config, stream.collect()).await?;
    Ok(results
        .into_iter()
        .filter_map(|r| match r {
            Ok(fetch) => Some(fetch),
            Err(e) => {
                warn!(error = %e, "uid fetch: skipping one malformed response, continuing batch");
                None
            }
        })
        .collect())
}

/// Fetch full RFC822 source for a batch of UIDs, used by the sync pipeline
pub async fn fetch_raw_messages(
    config: &EngineConfig,
    session: &mut ImapSession,
    uids: &[u32],
) -> AppResult<Vec<(u32, Vec<u8>)>> {
    let fetches = fetch_batch(config, session, uids, "UID RFC822 FLAGS X-GM-LABELS").await?;
    Ok(fetches
        .into_iter()
        .filter_map(|f| {
            let uid = f.uid?;
            let body = f.body()?.to_vec();
            Some((uid, body))
        })
        .collect())
}

pub async fn uid_store(
    config: &EngineConfig,
    session: &mut ImapSession,
    uid: u32,
    query: &str,
) -> AppResult<()> {
    let stream = timeout(config, session.uid_store(uid.to_string(), query))
        .await?
        .map_err(|e| AppError::Internal(format!("uid store failed: {e}")))?;
    let _: Vec<Fetch> = timeout(config, stream.try_collect())
        .await?
        .map_err(|e| AppError::Internal(format!("uid store stream failed: {e}")))?;
    Ok(())
}

pub async fn uid_move(
    config: &EngineConfig,
    session: &mut ImapSession,
    uid: u32,
    mailbox: &str,
) -> AppResult<()> {
    timeout(config, session.uid_mv(uid.to_string(), mailbox))
        .await?
        .map_err(|e| AppError::Internal(format!("uid move failed: {e}")))
}

pub async fn noop(config: &EngineConfig, session: &mut ImapSession) -> AppResult<()> {
    timeout(config, session.noop())
        .await?
        .map_err(|e| AppError::Internal(format!("noop failed: {e}")))
}

/// Run a future with the configured socket timeout, collapsing the
/// elapsed-time error into [`AppError::Timeout`]
async fn timeout<F, T>(config: &EngineConfig, fut: F) -> AppResult<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(socket_timeout(config), fut)
        .await
        .map_err(|_| AppError::Timeout("imap command timed out".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DateRange, SearchCriteria};
    use chrono::Utc;

    #[test]
    fn gmail_query_takes_precedence_over_all_other_fields() {
        let mut criteria = SearchCriteria::with_defaults();
        criteria.gmail_query = Some("from:boss@example.com is:unread".to_owned());
        criteria.subject = Some("ignored".to_owned());
        assert_eq!(
            build_search_query(&criteria),
            "X-GM-RAW \"from:boss@example.com is:unread\""
        );
    }

    #[test]
    fn builds_combined_search_terms() {
        let mut criteria = SearchCriteria::with_defaults();
        criteria.subject = Some("invoice".to_owned());
        criteria.is_unread = Some(true);
        let query = build_search_query(&criteria);
        assert!(query.contains("SUBJECT \"invoice\""));
        assert!(query.contains("UNSEEN"));
    }

    #[test]
    fn empty_criteria_searches_all() {
        let criteria = SearchCriteria::with_defaults();
        assert_eq!(build_search_query(&criteria), "ALL");
    }

    #[test]
    fn date_range_uses_imap_date_format() {
        let mut criteria = SearchCriteria::with_defaults();
        criteria.date_range = Some(DateRange {
            since: Some(Utc::now()),
            before: None,
        });
        assert!(build_search_query(&criteria).starts_with("SINCE "));
    }
}
