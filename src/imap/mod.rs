//! IMAP transport and session management
//!
//! `connection` owns TLS connect/login, the reusable session guard, and
//! the NOOP keepalive loop; `ops` wraps the timeout-bounded session
//! commands; `idle` drives the IDLE state machine described in spec.md §5.

mod connection;
mod idle;
pub(crate) mod ops;

pub use connection::{ImapClient, run_keepalive_loop};
pub use idle::{IdleEvent, IdleState, run_idle_loop};
pub use ops::{MailboxSelection, SelectMode};

use tokio::net::TcpStream;

/// Authenticated IMAP session over TLS
pub type ImapSession = async_imap::Session<tokio_rustls::client::TlsStream<TcpStream>>;
