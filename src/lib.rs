//! Compression forward proxy.
//!
//! ```text
//!                        ┌───────────────────────────────────────────┐
//!                        │                  PROXY                    │
//!                        │                                           │
//!    Client Request      │  ┌────────┐   ┌─────────┐   ┌─────────┐  │
//!    ────────────────────┼─▶│ proxy  │──▶│ forward │──▶│ http    │──┼──▶ Origin
//!    (or CONNECT tunnel) │  │dispatch│   │         │   │ client  │  │
//!                        │  └───┬────┘   └─────────┘   └────┬────┘  │
//!                        │      │                           │       │
//!                        │      ▼                           ▼       │
//!                        │  ┌────────┐   ┌─────────────────────┐    │
//!                        │  │ mitm   │   │  transcode pipeline │    │
//!    Client Response     │  │ bridge │   │ images / text / zip │    │
//!    ◀───────────────────┼──┴────────┴───┴─────────────────────┴────┼─── Origin
//!                        └───────────────────────────────────────────┘
//! ```
//!
//! Responses flow back through a registry of [`transcode::Transcoder`]s
//! keyed by media type: images are re-encoded (WebP when the client
//! accepts it), text is optionally minified and everything compressible
//! is gzip- or brotli-compressed according to the client's own
//! `Accept-Encoding`. HTTPS traffic is intercepted via CONNECT with
//! certificates forged under an operator-provided CA ([`mitm`]).

pub mod config;
pub mod error;
pub mod mitm;
pub mod proxy;
pub mod transcode;

pub use config::{Args, Config};
pub use error::CompyError;
pub use proxy::Proxy;
