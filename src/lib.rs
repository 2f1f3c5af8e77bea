//! Strata DLM - the distributed lock manager behind Strata's coherent caching.
//!
//! Clients take locks on named resources from a lock server before caching
//! the data those resources stand for. When another client needs a
//! conflicting lock, the server calls back the holders, waits for them to
//! give their locks back, and evicts any client that stops answering, so one
//! dead node never stalls the rest.
//!
//! # Features
//!
//! - **Seven lock modes**: EX, PW, PR, CW, CR, NL and GROUP, with the classic
//!   compatibility matrix.
//! - **Four lock types**: plain, byte-range extent, POSIX flock and inode-bits.
//! - **Callback protocol**: blocking, completion and glimpse callbacks, with
//!   per-lock callback timers and eviction of unresponsive clients.
//! - **Client lock cache**: unused locks are kept and given back by aged,
//!   shrink and lock-volume policies, piggy-backed on other requests.
//! - **Recovery**: lock replay after reconnect and local invalidation after
//!   eviction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   enqueue / convert / cancel  ┌──────────────────────────────┐
//! │ LockClient                   │ ────────────────────────────▶ │ LockServer                   │
//! │  client Namespace            │                               │  server Namespace            │
//! │  unused cache + LRU policies │ ◀──────────────────────────── │  exports, waiting locks      │
//! │  blocking pool               │   blocking / completion /     │  eviction, blocking pool     │
//! └──────────────────────────────┘   glimpse callbacks           └──────────────────────────────┘
//! ```
//!
//! Both sides talk through the [`rpc::Transport`] trait; encoding messages is
//! up to whoever implements it.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_dlm::config::DlmConfig;
//! use strata_dlm::server::LockServer;
//! use strata_dlm::types::{LockFlags, LockMode, LockType, PolicyData, ResourceId};
//!
//! #[tokio::main]
//! async fn main() -> strata_dlm::Result<()> {
//!     let server = LockServer::start("mdt0", DlmConfig::development());
//!     let lock = server
//!         .enqueue_local(
//!             ResourceId::new(42),
//!             LockType::Ibits,
//!             LockMode::Pr,
//!             PolicyData::Ibits { bits: 0b1 },
//!             LockFlags::empty(),
//!         )
//!         .await?;
//!     server.decref(&lock, LockMode::Pr).await;
//!     server.shutdown(false).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod ast;
pub mod client;
pub mod export;
pub mod handle;
pub mod lock;
pub mod namespace;
pub mod observability;
pub mod policy;
pub mod resource;
pub mod rpc;
pub mod server;
pub mod shutdown;

// Re-exports
pub use client::{LockClient, LockObserver};
pub use error::{DlmError, Result};
pub use server::LockServer;
pub use types::*;
