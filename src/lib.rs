//! tourcal-sync - synchronization and identity-claim layer for TourCal
//!
//! Client-side plumbing between a touring-crew companion app and its
//! remote multi-tenant record store. The layers, bottom up:
//!
//! - [`storage`]: file-backed key-value persistence for the credential,
//!   the auxiliary session id, and the active tour choice
//! - [`session`]: credential lifecycle and identity resolution, with
//!   coalesced confirmation and a pub/sub surface for state changes
//! - [`transport`]: authenticated JSON calls with centralized retry,
//!   backoff, and session invalidation policy
//! - [`sync`]: typed record CRUD with optimistic concurrency and a
//!   fallback cache for dead-network reads
//! - [`tours`]: the merged private-plus-shared tour catalog with share
//!   role detection
//! - [`claim`]: invite redemption, writing the caller's identity into a
//!   shared crew slot exactly once (modulo the documented race)
//! - [`lock_window`]: pure recurring lock-window evaluation
//!
//! Wiring order: open a [`storage::FileStore`], build a
//! [`session::SessionStore`] over it, hand both to
//! [`transport::TransportClient::new`] (which registers itself as the
//! session's identity confirmer), then layer [`sync::RecordSyncClient`],
//! [`tours::TourCatalog`], and [`claim::ClaimProtocol`] on top.

pub mod cache;
pub mod claim;
pub mod config;
pub mod error;
pub mod http;
pub mod lock_window;
pub mod records;
pub mod session;
pub mod storage;
pub mod sync;
pub mod tours;
pub mod transport;

pub use cache::FallbackCache;
pub use claim::{ClaimError, ClaimOutcome, ClaimPhase, ClaimProtocol, Invitation};
pub use config::StoreConfig;
pub use error::StoreError;
pub use lock_window::{sheet_locked, LockSchedule};
pub use records::{Database, FieldValue, Filter, Record, Sort, ZoneRef};
pub use session::{Identity, SessionState, SessionStore, Token};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use sync::RecordSyncClient;
pub use tours::{Tour, TourCatalog};
pub use transport::TransportClient;
