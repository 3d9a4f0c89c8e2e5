//! Protocol record schemas and their bit-exact encoding.

use crate::proto::wire::{
    WireError, WireReader, put_bool, put_buffer, put_i32, put_i64, put_string, put_string_vec,
};
use crate::types::{Acl, Id, Stat};

/// XID reserved for server-pushed watch notifications.
pub const NOTIFICATION_XID: i32 = -1;
/// XID reserved for heartbeats.
pub const PING_XID: i32 = -2;
/// XID reserved for auth exchanges.
pub const AUTH_XID: i32 = -4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Notification = 0,
    Create = 1,
    Delete = 2,
    Exists = 3,
    GetData = 4,
    SetData = 5,
    GetAcl = 6,
    SetAcl = 7,
    GetChildren = 8,
    Sync = 9,
    Ping = 11,
    GetChildren2 = 12,
    Check = 13,
    Multi = 14,
    Auth = 100,
    SetWatches = 101,
    CloseSession = -11,
}

impl OpCode {
    pub fn wire_value(self) -> i32 {
        self as i32
    }

    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(OpCode::Notification),
            1 => Some(OpCode::Create),
            2 => Some(OpCode::Delete),
            3 => Some(OpCode::Exists),
            4 => Some(OpCode::GetData),
            5 => Some(OpCode::SetData),
            6 => Some(OpCode::GetAcl),
            7 => Some(OpCode::SetAcl),
            8 => Some(OpCode::GetChildren),
            9 => Some(OpCode::Sync),
            11 => Some(OpCode::Ping),
            12 => Some(OpCode::GetChildren2),
            13 => Some(OpCode::Check),
            14 => Some(OpCode::Multi),
            100 => Some(OpCode::Auth),
            101 => Some(OpCode::SetWatches),
            -11 => Some(OpCode::CloseSession),
            _ => None,
        }
    }
}

pub fn encode_stat(buf: &mut Vec<u8>, stat: &Stat) {
    put_i64(buf, stat.czxid);
    put_i64(buf, stat.mzxid);
    put_i64(buf, stat.ctime);
    put_i64(buf, stat.mtime);
    put_i32(buf, stat.version);
    put_i32(buf, stat.cversion);
    put_i32(buf, stat.aversion);
    put_i64(buf, stat.ephemeral_owner);
    put_i32(buf, stat.data_length);
    put_i32(buf, stat.num_children);
    put_i64(buf, stat.pzxid);
}

pub fn decode_stat(r: &mut WireReader<'_>) -> Result<Stat, WireError> {
    Ok(Stat {
        czxid: r.read_i64("stat.czxid")?,
        mzxid: r.read_i64("stat.mzxid")?,
        ctime: r.read_i64("stat.ctime")?,
        mtime: r.read_i64("stat.mtime")?,
        version: r.read_i32("stat.version")?,
        cversion: r.read_i32("stat.cversion")?,
        aversion: r.read_i32("stat.aversion")?,
        ephemeral_owner: r.read_i64("stat.ephemeralOwner")?,
        data_length: r.read_i32("stat.dataLength")?,
        num_children: r.read_i32("stat.numChildren")?,
        pzxid: r.read_i64("stat.pzxid")?,
    })
}

pub fn encode_acl_vec(buf: &mut Vec<u8>, acl: &[Acl]) {
    put_i32(buf, acl.len() as i32);
    for entry in acl {
        put_i32(buf, entry.perms);
        put_string(buf, &entry.id.scheme);
        put_string(buf, &entry.id.id);
    }
}

pub fn decode_acl_vec(r: &mut WireReader<'_>) -> Result<Vec<Acl>, WireError> {
    let count = r.read_i32("acl.count")?;
    if count < 0 {
        return Err(WireError::Malformed {
            field: "acl.count",
            reason: "negative length",
        });
    }
    let mut out = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let perms = r.read_i32("acl.perms")?;
        let scheme = r.read_string("acl.id.scheme")?;
        let id = r.read_string("acl.id.id")?;
        out.push(Acl::new(perms, Id::new(scheme, id)));
    }
    Ok(out)
}

/// Handshake request; sent bare, without a request header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl ConnectRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_i32(buf, self.protocol_version);
        put_i64(buf, self.last_zxid_seen);
        put_i32(buf, self.timeout_ms);
        put_i64(buf, self.session_id);
        put_buffer(buf, Some(&self.password));
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            protocol_version: r.read_i32("connect.protocolVersion")?,
            last_zxid_seen: r.read_i64("connect.lastZxidSeen")?,
            timeout_ms: r.read_i32("connect.timeout")?,
            session_id: r.read_i64("connect.sessionId")?,
            password: r.read_buffer("connect.password")?.unwrap_or_default(),
        })
    }
}

/// Handshake reply. `session_id == 0` means the session was repudiated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl ConnectResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_i32(buf, self.protocol_version);
        put_i32(buf, self.timeout_ms);
        put_i64(buf, self.session_id);
        put_buffer(buf, Some(&self.password));
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            protocol_version: r.read_i32("connect.protocolVersion")?,
            timeout_ms: r.read_i32("connect.timeout")?,
            session_id: r.read_i64("connect.sessionId")?,
            password: r.read_buffer("connect.password")?.unwrap_or_default(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub xid: i32,
    pub opcode: i32,
}

impl RequestHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_i32(buf, self.xid);
        put_i32(buf, self.opcode);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            xid: r.read_i32("header.xid")?,
            opcode: r.read_i32("header.type")?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl ReplyHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_i32(buf, self.xid);
        put_i64(buf, self.zxid);
        put_i32(buf, self.err);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            xid: r.read_i32("reply.xid")?,
            zxid: r.read_i64("reply.zxid")?,
            err: r.read_i32("reply.err")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub acl: Vec<Acl>,
    pub flags: i32,
}

impl CreateRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string(buf, &self.path);
        put_buffer(buf, Some(&self.data));
        encode_acl_vec(buf, &self.acl);
        put_i32(buf, self.flags);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            path: r.read_string("create.path")?,
            data: r.read_buffer("create.data")?.unwrap_or_default(),
            acl: decode_acl_vec(r)?,
            flags: r.read_i32("create.flags")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateResponse {
    pub path: String,
}

impl CreateResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string(buf, &self.path);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            path: r.read_string("create.path")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteRequest {
    pub path: String,
    pub version: i32,
}

impl DeleteRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string(buf, &self.path);
        put_i32(buf, self.version);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            path: r.read_string("delete.path")?,
            version: r.read_i32("delete.version")?,
        })
    }
}

/// Shared layout of `Exists`, `GetData`, `GetChildren` and `GetChildren2`
/// requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathWatchRequest {
    pub path: String,
    pub watch: bool,
}

impl PathWatchRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string(buf, &self.path);
        put_bool(buf, self.watch);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            path: r.read_string("request.path")?,
            watch: r.read_bool("request.watch")?,
        })
    }
}

/// Shared layout of `GetACL` and `Sync` requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathRequest {
    pub path: String,
}

impl PathRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string(buf, &self.path);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            path: r.read_string("request.path")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathResponse {
    pub path: String,
}

impl PathResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string(buf, &self.path);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            path: r.read_string("response.path")?,
        })
    }
}

/// Shared layout of `Exists`, `SetData` and `SetACL` replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatResponse {
    pub stat: Stat,
}

impl StatResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        encode_stat(buf, &self.stat);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            stat: decode_stat(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetDataResponse {
    pub data: Vec<u8>,
    pub stat: Stat,
}

impl GetDataResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_buffer(buf, Some(&self.data));
        encode_stat(buf, &self.stat);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            data: r.read_buffer("getData.data")?.unwrap_or_default(),
            stat: decode_stat(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetDataRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub version: i32,
}

impl SetDataRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string(buf, &self.path);
        put_buffer(buf, Some(&self.data));
        put_i32(buf, self.version);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            path: r.read_string("setData.path")?,
            data: r.read_buffer("setData.data")?.unwrap_or_default(),
            version: r.read_i32("setData.version")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetChildrenResponse {
    pub children: Vec<String>,
}

impl GetChildrenResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string_vec(buf, &self.children);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            children: r.read_string_vec("getChildren.children")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetChildren2Response {
    pub children: Vec<String>,
    pub stat: Stat,
}

impl GetChildren2Response {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string_vec(buf, &self.children);
        encode_stat(buf, &self.stat);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            children: r.read_string_vec("getChildren2.children")?,
            stat: decode_stat(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetAclResponse {
    pub acl: Vec<Acl>,
    pub stat: Stat,
}

impl GetAclResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        encode_acl_vec(buf, &self.acl);
        encode_stat(buf, &self.stat);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            acl: decode_acl_vec(r)?,
            stat: decode_stat(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetAclRequest {
    pub path: String,
    pub acl: Vec<Acl>,
    pub version: i32,
}

impl SetAclRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string(buf, &self.path);
        encode_acl_vec(buf, &self.acl);
        put_i32(buf, self.version);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            path: r.read_string("setAcl.path")?,
            acl: decode_acl_vec(r)?,
            version: r.read_i32("setAcl.version")?,
        })
    }
}

/// Version guard inside a `multi` transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckVersionRequest {
    pub path: String,
    pub version: i32,
}

impl CheckVersionRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_string(buf, &self.path);
        put_i32(buf, self.version);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            path: r.read_string("check.path")?,
            version: r.read_i32("check.version")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthRequest {
    pub auth_type: i32,
    pub scheme: String,
    pub auth: Vec<u8>,
}

impl AuthRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_i32(buf, self.auth_type);
        put_string(buf, &self.scheme);
        put_buffer(buf, Some(&self.auth));
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            auth_type: r.read_i32("auth.type")?,
            scheme: r.read_string("auth.scheme")?,
            auth: r.read_buffer("auth.auth")?.unwrap_or_default(),
        })
    }
}

/// Re-arms server-side watches after a reconnect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetWatchesRequest {
    pub relative_zxid: i64,
    pub data_watches: Vec<String>,
    pub exist_watches: Vec<String>,
    pub child_watches: Vec<String>,
}

impl SetWatchesRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_i64(buf, self.relative_zxid);
        put_string_vec(buf, &self.data_watches);
        put_string_vec(buf, &self.exist_watches);
        put_string_vec(buf, &self.child_watches);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            relative_zxid: r.read_i64("setWatches.relativeZxid")?,
            data_watches: r.read_string_vec("setWatches.dataWatches")?,
            exist_watches: r.read_string_vec("setWatches.existWatches")?,
            child_watches: r.read_string_vec("setWatches.childWatches")?,
        })
    }
}

/// Server-pushed notification body; paths are still chroot-prefixed here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatcherEvent {
    pub event_type: i32,
    pub state: i32,
    pub path: String,
}

impl WatcherEvent {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_i32(buf, self.event_type);
        put_i32(buf, self.state);
        put_string(buf, &self.path);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            event_type: r.read_i32("event.type")?,
            state: r.read_i32("event.state")?,
            path: r.read_string("event.path")?,
        })
    }
}

/// Per-segment header inside `Multi` requests and responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultiHeader {
    pub op: i32,
    pub done: bool,
    pub err: i32,
}

impl MultiHeader {
    pub const DONE: MultiHeader = MultiHeader {
        op: -1,
        done: true,
        err: -1,
    };

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_i32(buf, self.op);
        put_bool(buf, self.done);
        put_i32(buf, self.err);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            op: r.read_i32("multi.type")?,
            done: r.read_bool("multi.done")?,
            err: r.read_i32("multi.err")?,
        })
    }
}

/// Builds one complete client frame: request header plus encoded body.
pub fn encode_request_frame(xid: i32, opcode: OpCode, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + body.len());
    RequestHeader {
        xid,
        opcode: opcode.wire_value(),
    }
    .encode(&mut frame);
    frame.extend_from_slice(body);
    frame
}
