//! A distributed coordination service: a shared key → value namespace
//! with single-writer/multi-reader exclusion, session-aware lock
//! cleanup, and a per-session cache kept coherent by lock-release and
//! invalidation gossip.
//!
//! The components below are layered bottom-up, mirroring the component
//! ordering in the design: [`storage`] holds the versioned entry model
//! and its CAS contract, [`session`] and [`directory`] are the
//! collaborators the rest of the stack consults, [`exchange`] gossips
//! release/invalidation messages between sessions, [`wait`] and
//! [`lock`] implement the global locking protocol on top of that, and
//! [`cache`] + [`coordination`] expose the client-facing surface that
//! [`server`] puts on the wire for the `coord-server`/`coord-cli`
//! binaries.

pub mod cache;
pub mod common;
pub mod config;
pub mod coordination;
pub mod directory;
pub mod error;
pub mod exchange;
pub mod lock;
pub mod server;
pub mod session;
pub mod storage;
pub mod wait;

pub use common::{CancellationToken, Key, SessionId};
pub use config::CoordinationConfig;
pub use coordination::CoordinationManager;
pub use error::{CoordinationError, Result};
pub use storage::{CoordinationStorage, InMemoryStorage, RetryingStorage, StoredEntry};
