//! TLS connect, login, and connection lifecycle
//!
//! Adapted from the teacher's single-shot `connect_authenticated`: the same
//! phase-by-phase timeout wrapping, generalized to one always-on account
//! instead of a named-account table, plus a held `Mutex<Option<Session>>`
//! so the sync service and the IDLE loop can share one physical connection
//! without fighting over ownership.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_imap::Client;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::ImapSession;
use crate::config::{AccountConfig, EngineConfig};
use crate::errors::{AppError, AppResult};

/// Owns the current authenticated session, reconnecting on demand
///
/// Only one task drives the physical socket at a time: the sync service
/// takes the session for a batch of commands, returns it, and the IDLE
/// loop picks it up between batches. Serialized through the inner mutex.
pub struct ImapClient {
    config: EngineConfig,
    session: Mutex<Option<ImapSession>>,
    /// Set while the IDLE loop holds the session outside the mutex (see
    /// [`ImapClient::take`]); the keepalive loop skips its tick while this
    /// is set since an active IDLE command already keeps the connection
    /// alive.
    idling: AtomicBool,
}

impl ImapClient {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            idling: AtomicBool::new(false),
        }
    }

    /// Acquire the session lock, connecting if none is currently held
    ///
    /// Callers run their IMAP commands against `guard.as_mut().unwrap()` and
    /// should call [`ImapClient::invalidate`] on protocol-level errors so the
    /// next acquisition reconnects instead of reusing a dead socket.
    pub async fn acquire(&self) -> AppResult<tokio::sync::MutexGuard<'_, Option<ImapSession>>> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(connect_authenticated(&self.config).await?);
        }
        Ok(guard)
    }

    /// Drop the held session, forcing the next `acquire` to reconnect
    ///
    /// Used by the sync service after a command fails and by the IDLE loop
    /// after an error or a clean interruption.
    pub async fn invalidate(&self) {
        *self.session.lock().await = None;
        // covers the case where `take()` set this and the session was then
        // lost to an error before `restore()` could clear it
        self.idling.store(false, Ordering::SeqCst);
    }

    /// Take the session out of the slot, connecting if none is held, without
    /// keeping the lock held afterward
    ///
    /// Used by the IDLE loop: `async_imap`'s `idle()` consumes the session by
    /// value, and the wait can take up to the full renewal window, so the
    /// session is owned outside the mutex for that duration instead of
    /// blocking every other caller of [`ImapClient::acquire`].
    pub async fn take(&self) -> AppResult<ImapSession> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(connect_authenticated(&self.config).await?);
        }
        self.idling.store(true, Ordering::SeqCst);
        Ok(guard.take().expect("guard populated above"))
    }

    /// Return a session taken via [`ImapClient::take`] to the slot
    pub async fn restore(&self, session: ImapSession) {
        *self.session.lock().await = Some(session);
        self.idling.store(false, Ordering::SeqCst);
    }

    /// Whether the IDLE loop currently holds the session outside the mutex
    fn is_idling(&self) -> bool {
        self.idling.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Connect, perform the TLS handshake, read the greeting, and log in
///
/// # Errors
///
/// - `Timeout` if any phase exceeds its configured budget
/// - `AuthFailed` if LOGIN is rejected
/// - `Internal` for TCP/TLS/protocol-level failures
pub async fn connect_authenticated(config: &EngineConfig) -> AppResult<ImapSession> {
    let account = &config.account;
    let connect_duration = Duration::from_millis(config.connect_timeout_ms);
    let auth_duration = Duration::from_millis(config.auth_timeout_ms);

    debug!(host = %account.host, port = account.port, "connecting to imap server");

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Internal(format!("tcp connect failed: {e}"))))?;

    let tls_stream = establish_tls(tcp, account, auth_duration).await?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(auth_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("imap greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("imap greeting failed: {e}"))))?;
    if greeting.is_none() {
        return Err(AppError::Internal(
            "imap server closed connection before greeting".to_owned(),
        ));
    }

    let pass = account.pass.expose_secret();
    let session = timeout(auth_duration, client.login(account.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("imap login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    AppError::AuthFailed(msg)
                } else {
                    AppError::Internal(msg)
                }
            })
        })?;

    info!(host = %account.host, user = %account.user, "imap session established");
    Ok(session)
}

async fn establish_tls(
    tcp: TcpStream,
    account: &AccountConfig,
    timeout_duration: Duration,
) -> AppResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid imap host for TLS SNI".to_owned()))?;

    timeout(timeout_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("tls handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("tls handshake failed: {e}"))))
}

/// Issue NOOP every `interval` to keep the connection alive while it isn't
/// already being kept alive by an active IDLE command (spec.md §4.2 "kept
/// alive via periodic no-ops (10s)")
pub async fn run_keepalive_loop(client: &ImapClient, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        ticker.tick().await;
        if client.is_idling() {
            continue;
        }

        let mut guard = match client.acquire().await {
            Ok(guard) => guard,
            Err(err) => {
                warn!(error = %err, "keepalive: failed to acquire imap session");
                continue;
            }
        };
        let session = guard.as_mut().expect("acquire populates session");
        if let Err(err) = super::ops::noop(&client.config, session).await {
            warn!(error = %err, "keepalive: noop failed, invalidating session");
            drop(guard);
            client.invalidate().await;
        }
    }
}
