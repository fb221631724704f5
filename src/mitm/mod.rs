//! TLS interception for CONNECT tunnels.
//!
//! # Responsibilities
//! - Forge leaf certificates for intercepted origins, signed by the
//!   operator's trusted CA ([`cert`]).
//! - Adapt hijacked client connections into async streams whose closure
//!   can be awaited ([`conn`]).
//! - Bridge a hijacked connection to the real origin over TLS and hand
//!   the decrypted client side to an internal HTTP server ([`listener`]).

mod cert;
mod conn;
mod listener;

pub use cert::CertFaker;
pub use conn::{ClosedSignal, MitmConn};
pub use listener::{HijackedIo, MitmAccept, MitmListener, TunnelStream};
