#![forbid(unsafe_code)]

//! Client library for ZooKeeper-compatible coordination ensembles.
//!
//! The heart of the crate is the session engine: one logical, ordered
//! request/reply conversation that survives TCP failures and server changes,
//! carries server-pushed watch events, and ends only on caller shutdown,
//! run deadline, or session expiration.

pub mod client;
pub mod config;
pub mod error;
pub mod proto;
pub mod session;
pub mod types;

pub use client::{CancelHandle, Client, Op, OpContext};
pub use config::{AuthInfo, SessionPolicy};
pub use error::{Error, ErrorCode, Result};
pub use session::SessionPhase;
pub use session::watch::Watcher;
pub use types::{
    Acl, CreateMode, EventType, Id, KeeperState, OpResult, Stat, WatchedEvent, creator_all_acl,
    open_acl_unsafe, read_acl_unsafe,
};
