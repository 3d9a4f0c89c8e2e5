//! Caller-facing protocol types, separate from their wire encoding.

use crate::error::ErrorCode;

pub const PERM_READ: i32 = 1 << 0;
pub const PERM_WRITE: i32 = 1 << 1;
pub const PERM_CREATE: i32 = 1 << 2;
pub const PERM_DELETE: i32 = 1 << 3;
pub const PERM_ADMIN: i32 = 1 << 4;
pub const PERM_ALL: i32 = PERM_READ | PERM_WRITE | PERM_CREATE | PERM_DELETE | PERM_ADMIN;

/// Authentication identity attached to an ACL entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Id {
    pub scheme: String,
    pub id: String,
}

impl Id {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acl {
    pub perms: i32,
    pub id: Id,
}

impl Acl {
    pub fn new(perms: i32, id: Id) -> Self {
        Self { perms, id }
    }
}

/// World-readable and world-writable; the usual default.
pub fn open_acl_unsafe() -> Vec<Acl> {
    vec![Acl::new(PERM_ALL, Id::new("world", "anyone"))]
}

/// Full access for the authenticated identity that creates the node.
pub fn creator_all_acl() -> Vec<Acl> {
    vec![Acl::new(PERM_ALL, Id::new("auth", ""))]
}

/// World-readable only.
pub fn read_acl_unsafe() -> Vec<Acl> {
    vec![Acl::new(PERM_READ, Id::new("world", "anyone"))]
}

/// Node metadata as reported by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn flags(self) -> i32 {
        match self {
            CreateMode::Persistent => 0,
            CreateMode::Ephemeral => 1,
            CreateMode::PersistentSequential => 2,
            CreateMode::EphemeralSequential => 3,
        }
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// What a watch fired for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl EventType {
    pub fn wire_value(self) -> i32 {
        match self {
            EventType::None => -1,
            EventType::NodeCreated => 1,
            EventType::NodeDeleted => 2,
            EventType::NodeDataChanged => 3,
            EventType::NodeChildrenChanged => 4,
        }
    }

    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            -1 => Some(EventType::None),
            1 => Some(EventType::NodeCreated),
            2 => Some(EventType::NodeDeleted),
            3 => Some(EventType::NodeDataChanged),
            4 => Some(EventType::NodeChildrenChanged),
            _ => None,
        }
    }
}

/// Session state carried inside watch events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeeperState {
    Disconnected,
    SyncConnected,
    AuthFailed,
    Expired,
}

impl KeeperState {
    pub fn wire_value(self) -> i32 {
        match self {
            KeeperState::Disconnected => 0,
            KeeperState::SyncConnected => 3,
            KeeperState::AuthFailed => 4,
            KeeperState::Expired => -112,
        }
    }

    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(KeeperState::Disconnected),
            3 => Some(KeeperState::SyncConnected),
            4 => Some(KeeperState::AuthFailed),
            -112 => Some(KeeperState::Expired),
            _ => None,
        }
    }
}

/// A single watch notification, with the path already un-chrooted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: KeeperState,
    pub path: String,
}

/// Per-op outcome of a `multi` transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum OpResult {
    Create { path: String },
    SetData { stat: Stat },
    Check,
    Delete,
    Error(ErrorCode),
}

impl OpResult {
    pub fn is_error(&self) -> bool {
        matches!(self, OpResult::Error(_))
    }
}
