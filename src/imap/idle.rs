//! IDLE state machine (spec.md §5 "Live monitoring")
//!
//! Structure borrowed from the reconnect/backoff loop pattern used for IMAP
//! IDLE monitoring in the reference pack (an `imap_idle` service built around
//! a `monitor_folder`/exponential-backoff shape), simplified to this spec's
//! fixed backoff and single always-on folder.

use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::ImapClient;
use super::ops::{MailboxSelection, SelectMode, select_mailbox};
use crate::errors::AppError;

/// Coarse state of the IDLE connection, exposed for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Disconnected,
    Connecting,
    Selected,
    Idling,
}

/// Emitted to the sync service whenever IDLE observes mailbox activity or a
/// renewal boundary is crossed
#[derive(Debug, Clone)]
pub enum IdleEvent {
    /// The server pushed an untagged `EXISTS`/`RECENT`/`EXPUNGE` response;
    /// a resync is warranted
    MailboxChanged,
    StateChanged(IdleState),
}

/// Drive the IDLE state machine against `folder` until the process is
/// cancelled, sending [`IdleEvent`]s on `events`
///
/// Reconnects with a fixed backoff (`idle_reconnect_backoff_ms`) on any
/// error and renews the IDLE command after `idle_renewal_ms` even absent
/// server activity, since most servers drop IDLE after ~29 minutes.
pub async fn run_idle_loop(client: &ImapClient, folder: &str, events: mpsc::Sender<IdleEvent>) {
    let backoff = Duration::from_millis(client.config().idle_reconnect_backoff_ms);
    let renewal = Duration::from_millis(client.config().idle_renewal_ms);

    loop {
        let _ = events.send(IdleEvent::StateChanged(IdleState::Connecting)).await;

        let selection = {
            let mut guard = match client.acquire().await {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(error = %err, "idle: failed to acquire imap session");
                    sleep(backoff).await;
                    continue;
                }
            };
            let session = guard.as_mut().expect("acquire populates session");
            select_mailbox(client.config(), session, folder, SelectMode::ReadOnly).await
        };

        let _selection: MailboxSelection = match selection {
            Ok(s) => s,
            Err(err) => {
                error!(error = %err, folder, "idle: failed to select folder");
                client.invalidate().await;
                sleep(backoff).await;
                continue;
            }
        };
        let _ = events.send(IdleEvent::StateChanged(IdleState::Selected)).await;

        if let Err(err) = idle_once(client, &events, renewal).await {
            warn!(error = %err, "idle: session ended, reconnecting");
            client.invalidate().await;
            let _ = events
                .send(IdleEvent::StateChanged(IdleState::Disconnected))
                .await;
            sleep(backoff).await;
        }
    }
}

/// Issue a single IDLE command, wait up to `renewal` for server activity or
/// the renewal deadline, then return so the caller can re-enter IDLE
///
/// The session is taken out of the shared slot for the duration of the
/// wait rather than held behind the mutex guard, so a concurrent sync
/// triggered elsewhere (e.g. a manual `/api/sync` call) isn't blocked for
/// up to the full renewal window.
async fn idle_once(
    client: &ImapClient,
    events: &mpsc::Sender<IdleEvent>,
    renewal: Duration,
) -> Result<(), AppError> {
    let session = client.take().await?;

    let mut idle = session.idle();
    idle.init()
        .await
        .map_err(|e| AppError::Internal(format!("idle init failed: {e}")))?;

    let _ = events.send(IdleEvent::StateChanged(IdleState::Idling)).await;
    info!("idle: entering wait");

    let (idle_wait, _interrupt) = idle.wait_with_timeout(renewal);
    let outcome = idle_wait.await;

    let session = idle
        .done()
        .await
        .map_err(|e| AppError::Internal(format!("idle done failed: {e}")))?;
    client.restore(session).await;

    match outcome {
        Ok(IdleResponse::NewData(data)) => {
            info!(bytes = data.len(), "idle: server pushed new data");
            let _ = events.send(IdleEvent::MailboxChanged).await;
        }
        Ok(IdleResponse::Timeout) => {
            info!("idle: renewal deadline reached, re-entering idle");
        }
        Ok(IdleResponse::ManualInterrupt) => {
            info!("idle: interrupted");
        }
        Err(e) => {
            return Err(AppError::Internal(format!("idle wait failed: {e}")));
        }
    }

    Ok(())
}
