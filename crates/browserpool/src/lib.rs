//! Browser-session pooling for multi-tenant chat automation.
//!
//! One validated "master" browser profile per account; chatters get
//! disposable worker clones of it. The pool enforces per-account limits
//! (one exclusive admin, a bounded chatter pool), queues over-limit
//! requests with a timeout, sweeps idle sessions, and reaps everything on
//! shutdown.
//!
//! ```text
//!  start_session ──► SessionController ──► ResourceManager (admission,
//!        │                 │                queues, session table)
//!        │                 ├──► ProfileSync (inject / copy auth state)
//!        │                 ├──► Launcher    (CDP context or native window)
//!        │                 └──► ProfileStore (on-disk layout, snapshots)
//!        ▼
//!   StartResult (user-facing, never a raw error)
//! ```

pub mod account;
pub mod audit;
pub mod config;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod manager;
pub mod profile;
pub mod session;
pub mod sync;

pub use account::{Account, AccountStore, MemoryAccountStore, UserInfo};
pub use audit::{AuditEntry, AuditSink, NoopAudit};
pub use config::{PoolConfig, DEFAULT_USER_AGENT};
pub use error::PoolError;
pub use launcher::{
    BrowserContext, InstalledBrowserStrategy, LaunchOptions, LaunchStrategy, Launcher,
};
pub use lifecycle::SessionController;
pub use manager::{AccountStats, PoolStats, ResourceManager, SessionFactory, SessionInfo};
pub use profile::{ProfileStore, RawCookie, SessionArtifacts};
pub use session::{SessionHandle, SessionKey, SessionRecord, SessionRole, SessionStatus, StartResult};
pub use sync::{CopyResult, ProfileSync, SyncStrategy};
