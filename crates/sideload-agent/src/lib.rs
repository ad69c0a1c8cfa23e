//! Sideloading Agent
//!
//! A long-running control-plane service that lets an operator tool push and
//! pull files into a sandboxed directory on a device and start or stop the
//! one managed application whose code lives there.
//!
//! # Architecture
//!
//! Every connection must complete a mutual TLS handshake before a single
//! byte of HTTP is read. Authenticated connections are served on their own
//! task; all of them share one [`AgentState`]:
//!
//! ```text
//! Operator tool                          Agent
//! │                                        │
//! │  TLS ClientHello + client certificate  │
//! │ ──────────────────────────────────────>│  verify against trust roots
//! │                                        │
//! │  PUT /files/app/main.py  (mtime: ...)  │
//! │ ──────────────────────────────────────>│  FileStore::write
//! │                   200 {}               │
//! │<────────────────────────────────────── │
//! │                                        │
//! │  POST /application                     │
//! │ ──────────────────────────────────────>│  ProcessManager::start
//! │           200 {} / 409 / 404           │
//! │<────────────────────────────────────── │
//! ```

mod config;
mod router;
mod server;
mod tls;

pub use config::{AgentConfig, ConfigError, DEFAULT_PORT};
pub use router::{AgentState, ApiError, MTIME_HEADER, router};
pub use server::{AgentHandle, ServerError, SideloadServer, shutdown_signal};
pub use tls::{MutualTlsBuilder, TlsError, crypto_provider};
