//! # warden-permissions
//!
//! Durable, per-origin permission state.
//!
//! Each `(origin, scope)` pair holds at most one [`Grant`]:
//!
//! ```text
//! NotGranted ──prompt──▶ GrantedOnce | GrantedAlways | Denied
//! GrantedOnce ──expiry / bound context closed──▶ NotGranted
//! Denied ──re-request──▶ Denied          (no re-prompt)
//! *  ──revoke(origin)──▶ NotGranted
//! ```
//!
//! An optional per-origin tool allowlist further restricts tool-invoking
//! capabilities. [`PermissionStore`] applies these rules on top of a
//! [`GrantRepository`] (in-memory or `SQLite`).

#![deny(unsafe_code)]

pub mod clock;
pub mod errors;
pub mod grant;
pub mod memory;
pub mod repository;
pub mod sqlite;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{PermissionError, Result};
pub use grant::{Grant, GrantDecision, GrantStatus, OriginPermissionRecord};
pub use memory::MemoryGrantRepository;
pub use repository::GrantRepository;
pub use sqlite::SqliteGrantRepository;
pub use store::{PermissionStore, ScopeCheck};
