//! In-process scripted server speaking the ZooKeeper wire protocol.
//!
//! Enough of the real thing to exercise the client end to end: sessions
//! that survive reconnects, a shared node tree, server-side watches,
//! atomic multi, and handles for killing connections and expiring sessions.

use std::collections::{BTreeMap, HashMap};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam::channel::{Sender, unbounded};

use zk_client::proto::frame::{FrameReader, FrameWriter};
use zk_client::proto::records::{
    AUTH_XID, AuthRequest, CheckVersionRequest, ConnectRequest, ConnectResponse, CreateRequest,
    CreateResponse, DeleteRequest, GetAclResponse, GetChildren2Response, GetChildrenResponse,
    GetDataResponse, MultiHeader, NOTIFICATION_XID, OpCode, PING_XID, PathRequest, PathResponse,
    PathWatchRequest, ReplyHeader, RequestHeader, SetAclRequest, SetDataRequest,
    SetWatchesRequest, StatResponse, WatcherEvent, encode_stat,
};
use zk_client::proto::wire::{WireReader, put_i32};
use zk_client::types::{Acl, Id, Stat};

const MAX_FRAME: usize = 4 * 1024 * 1024;

const ERR_NO_NODE: i32 = -101;
const ERR_BAD_VERSION: i32 = -103;
const ERR_NO_CHILDREN_FOR_EPHEMERALS: i32 = -108;
const ERR_NODE_EXISTS: i32 = -110;
const ERR_NOT_EMPTY: i32 = -111;
const ERR_RUNTIME_INCONSISTENCY: i32 = -2;
const ERR_UNIMPLEMENTED: i32 = -6;

const EVENT_CREATED: i32 = 1;
const EVENT_DELETED: i32 = 2;
const EVENT_DATA_CHANGED: i32 = 3;
const EVENT_CHILDREN_CHANGED: i32 = 4;

const STATE_SYNC_CONNECTED: i32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchKind {
    Data,
    Exists,
    Child,
}

#[derive(Clone, Debug)]
struct Node {
    data: Vec<u8>,
    acl: Vec<Acl>,
    czxid: i64,
    mzxid: i64,
    pzxid: i64,
    version: i32,
    cversion: i32,
    aversion: i32,
    ephemeral_owner: i64,
}

impl Node {
    fn root() -> Self {
        Self {
            data: Vec::new(),
            acl: zk_client::open_acl_unsafe(),
            czxid: 0,
            mzxid: 0,
            pzxid: 0,
            version: 0,
            cversion: 0,
            aversion: 0,
            ephemeral_owner: 0,
        }
    }
}

struct Session {
    password: Vec<u8>,
    timeout_ms: i32,
    expired: bool,
    auth: Option<Id>,
}

struct ConnHandle {
    socket: TcpStream,
    out_tx: Sender<Vec<u8>>,
}

struct Watch {
    kind: WatchKind,
    path: String,
    conn: u64,
}

struct PendingFire {
    event_type: i32,
    path: String,
    kinds: &'static [WatchKind],
}

struct State {
    tree: BTreeMap<String, Node>,
    sessions: HashMap<i64, Session>,
    conns: HashMap<u64, ConnHandle>,
    watches: Vec<Watch>,
    next_session: i64,
    next_conn: u64,
    zxid: i64,
}

impl State {
    fn new() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), Node::root());
        Self {
            tree,
            sessions: HashMap::new(),
            conns: HashMap::new(),
            watches: Vec::new(),
            next_session: 0,
            next_conn: 0,
            zxid: 0,
        }
    }

    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn parent_of(path: &str) -> Option<String> {
        if path == "/" {
            return None;
        }
        match path.rfind('/') {
            Some(0) => Some("/".to_string()),
            Some(idx) => Some(path[..idx].to_string()),
            None => None,
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut names: Vec<String> = self
            .tree
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        names.sort();
        names
    }

    fn stat_of(&self, path: &str) -> Stat {
        let node = &self.tree[path];
        Stat {
            czxid: node.czxid,
            mzxid: node.mzxid,
            ctime: 0,
            mtime: 0,
            version: node.version,
            cversion: node.cversion,
            aversion: node.aversion,
            ephemeral_owner: node.ephemeral_owner,
            data_length: node.data.len() as i32,
            num_children: self.children_of(path).len() as i32,
            pzxid: node.pzxid,
        }
    }

    fn arm_watch(&mut self, kind: WatchKind, path: &str, conn: u64) {
        let exists = self
            .watches
            .iter()
            .any(|w| w.kind == kind && w.path == path && w.conn == conn);
        if !exists {
            self.watches.push(Watch {
                kind,
                path: path.to_string(),
                conn,
            });
        }
    }

    fn fire(&mut self, fires: Vec<PendingFire>) {
        for fire in fires {
            let mut targets = Vec::new();
            self.watches.retain(|w| {
                if fire.kinds.contains(&w.kind) && w.path == fire.path {
                    targets.push(w.conn);
                    false
                } else {
                    true
                }
            });
            for conn in targets {
                if let Some(handle) = self.conns.get(&conn) {
                    let mut frame = Vec::new();
                    ReplyHeader {
                        xid: NOTIFICATION_XID,
                        zxid: -1,
                        err: 0,
                    }
                    .encode(&mut frame);
                    WatcherEvent {
                        event_type: fire.event_type,
                        state: STATE_SYNC_CONNECTED,
                        path: fire.path.clone(),
                    }
                    .encode(&mut frame);
                    let _ = handle.out_tx.send(frame);
                }
            }
        }
    }

    fn create(
        &mut self,
        req: &CreateRequest,
        session: i64,
        fires: &mut Vec<PendingFire>,
    ) -> Result<String, i32> {
        let parent = Self::parent_of(&req.path).ok_or(ERR_NODE_EXISTS)?;
        let parent_node = self.tree.get(&parent).ok_or(ERR_NO_NODE)?;
        if parent_node.ephemeral_owner != 0 {
            return Err(ERR_NO_CHILDREN_FOR_EPHEMERALS);
        }
        let sequential = req.flags & 2 != 0;
        let path = if sequential {
            format!("{}{:010}", req.path, parent_node.cversion)
        } else {
            req.path.clone()
        };
        if self.tree.contains_key(&path) {
            return Err(ERR_NODE_EXISTS);
        }

        let zxid = self.next_zxid();
        let session_auth = self
            .sessions
            .get(&session)
            .and_then(|s| s.auth.clone());
        let acl = req
            .acl
            .iter()
            .map(|entry| {
                if entry.id.scheme == "auth" {
                    Acl::new(
                        entry.perms,
                        session_auth
                            .clone()
                            .unwrap_or_else(|| Id::new("world", "anyone")),
                    )
                } else {
                    entry.clone()
                }
            })
            .collect();

        let parent_node = self.tree.get_mut(&parent).expect("parent checked");
        parent_node.cversion += 1;
        parent_node.pzxid = zxid;
        self.tree.insert(
            path.clone(),
            Node {
                data: req.data.clone(),
                acl,
                czxid: zxid,
                mzxid: zxid,
                pzxid: zxid,
                version: 0,
                cversion: 0,
                aversion: 0,
                ephemeral_owner: if req.flags & 1 != 0 { session } else { 0 },
            },
        );

        fires.push(PendingFire {
            event_type: EVENT_CREATED,
            path: path.clone(),
            kinds: &[WatchKind::Exists],
        });
        fires.push(PendingFire {
            event_type: EVENT_CHILDREN_CHANGED,
            path: parent,
            kinds: &[WatchKind::Child],
        });
        Ok(path)
    }

    fn delete(
        &mut self,
        req: &DeleteRequest,
        fires: &mut Vec<PendingFire>,
    ) -> Result<(), i32> {
        let node = self.tree.get(&req.path).ok_or(ERR_NO_NODE)?;
        if req.version != -1 && req.version != node.version {
            return Err(ERR_BAD_VERSION);
        }
        if !self.children_of(&req.path).is_empty() {
            return Err(ERR_NOT_EMPTY);
        }
        let zxid = self.next_zxid();
        self.tree.remove(&req.path);
        if let Some(parent) = Self::parent_of(&req.path) {
            if let Some(parent_node) = self.tree.get_mut(&parent) {
                parent_node.cversion += 1;
                parent_node.pzxid = zxid;
            }
            fires.push(PendingFire {
                event_type: EVENT_CHILDREN_CHANGED,
                path: parent,
                kinds: &[WatchKind::Child],
            });
        }
        fires.push(PendingFire {
            event_type: EVENT_DELETED,
            path: req.path.clone(),
            kinds: &[WatchKind::Data, WatchKind::Exists, WatchKind::Child],
        });
        Ok(())
    }

    fn set_data(
        &mut self,
        req: &SetDataRequest,
        fires: &mut Vec<PendingFire>,
    ) -> Result<Stat, i32> {
        {
            let node = self.tree.get(&req.path).ok_or(ERR_NO_NODE)?;
            if req.version != -1 && req.version != node.version {
                return Err(ERR_BAD_VERSION);
            }
        }
        let zxid = self.next_zxid();
        let node = self.tree.get_mut(&req.path).expect("checked above");
        node.data = req.data.clone();
        node.version += 1;
        node.mzxid = zxid;
        fires.push(PendingFire {
            event_type: EVENT_DATA_CHANGED,
            path: req.path.clone(),
            kinds: &[WatchKind::Data, WatchKind::Exists],
        });
        Ok(self.stat_of(&req.path))
    }

    fn check_version(&self, req: &CheckVersionRequest) -> Result<(), i32> {
        let node = self.tree.get(&req.path).ok_or(ERR_NO_NODE)?;
        if req.version != -1 && req.version != node.version {
            return Err(ERR_BAD_VERSION);
        }
        Ok(())
    }

    /// Deletes a dead session's ephemerals, firing watches.
    fn reap_session(&mut self, session: i64) {
        let owned: Vec<String> = self
            .tree
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            let mut fires = Vec::new();
            let _ = self.delete(
                &DeleteRequest { path, version: -1 },
                &mut fires,
            );
            self.fire(fires);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    shutdown: AtomicBool,
}

pub struct MockServer {
    addr: String,
    inner: Arc<Inner>,
}

impl MockServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("local addr").to_string();
        let inner = Arc::new(Inner {
            state: Mutex::new(State::new()),
            shutdown: AtomicBool::new(false),
        });

        let accept_inner = Arc::clone(&inner);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_inner.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let Ok(stream) = stream else { break };
                let conn_inner = Arc::clone(&accept_inner);
                thread::spawn(move || handle_conn(conn_inner, stream));
            }
        });

        Self { addr, inner }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Severs every live connection; sessions survive for reconnection.
    pub fn kill_connections(&self) {
        let state = self.inner.state.lock().unwrap();
        for handle in state.conns.values() {
            let _ = handle.socket.shutdown(Shutdown::Both);
        }
    }

    /// Marks every session expired; the next handshake is repudiated.
    pub fn expire_all_sessions(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let ids: Vec<i64> = state.sessions.keys().copied().collect();
        for id in &ids {
            state.sessions.get_mut(id).unwrap().expired = true;
        }
        for id in ids {
            state.reap_session(id);
        }
    }

    pub fn has_node(&self, path: &str) -> bool {
        self.inner.state.lock().unwrap().tree.contains_key(path)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.kill_connections();
        // unblock the accept loop
        let _ = TcpStream::connect(&self.addr);
    }
}

fn handle_conn(inner: Arc<Inner>, socket: TcpStream) {
    let _ = socket.set_nodelay(true);
    let Ok(reader_sock) = socket.try_clone() else {
        return;
    };
    let Ok(writer_sock) = socket.try_clone() else {
        return;
    };
    let mut reader = FrameReader::new(reader_sock, MAX_FRAME);

    let (out_tx, out_rx) = unbounded::<Vec<u8>>();
    let writer = thread::spawn(move || {
        let mut fw = FrameWriter::new(writer_sock, MAX_FRAME);
        while let Ok(frame) = out_rx.recv() {
            if fw.write_frame(&frame).is_err() {
                break;
            }
        }
    });

    // handshake
    let session_id = (|| {
        let frame = reader.read_next().ok().flatten()?;
        let mut r = WireReader::new(&frame);
        let req = ConnectRequest::decode(&mut r).ok()?;

        let mut state = inner.state.lock().unwrap();
        let (response, session_id) = if req.session_id != 0 {
            match state.sessions.get(&req.session_id) {
                Some(session) if !session.expired => (
                    ConnectResponse {
                        protocol_version: 0,
                        timeout_ms: session.timeout_ms,
                        session_id: req.session_id,
                        password: session.password.clone(),
                    },
                    req.session_id,
                ),
                _ => (
                    ConnectResponse {
                        protocol_version: 0,
                        timeout_ms: req.timeout_ms,
                        session_id: 0,
                        password: Vec::new(),
                    },
                    0,
                ),
            }
        } else {
            state.next_session += 1;
            let id = state.next_session;
            let password: Vec<u8> = (0..16).map(|i| (id as u8).wrapping_add(i)).collect();
            state.sessions.insert(
                id,
                Session {
                    password: password.clone(),
                    timeout_ms: req.timeout_ms,
                    expired: false,
                    auth: None,
                },
            );
            (
                ConnectResponse {
                    protocol_version: 0,
                    timeout_ms: req.timeout_ms,
                    session_id: id,
                    password,
                },
                id,
            )
        };

        let mut buf = Vec::new();
        response.encode(&mut buf);
        let _ = out_tx.send(buf);
        if session_id == 0 {
            return None;
        }
        Some(session_id)
    })();

    let Some(session_id) = session_id else {
        drop(out_tx);
        let _ = writer.join();
        return;
    };

    let conn_id = {
        let mut state = inner.state.lock().unwrap();
        state.next_conn += 1;
        let id = state.next_conn;
        state.conns.insert(
            id,
            ConnHandle {
                socket: socket.try_clone().expect("clone socket"),
                out_tx: out_tx.clone(),
            },
        );
        id
    };

    while let Ok(Some(frame)) = reader.read_next() {
        if !process_frame(&inner, conn_id, session_id, &frame, &out_tx) {
            break;
        }
    }

    let mut state = inner.state.lock().unwrap();
    state.conns.remove(&conn_id);
    state.watches.retain(|w| w.conn != conn_id);
    drop(state);
    drop(out_tx);
    let _ = writer.join();
}

fn send_reply(out: &Sender<Vec<u8>>, xid: i32, zxid: i64, err: i32, body: &[u8]) {
    let mut frame = Vec::new();
    ReplyHeader { xid, zxid, err }.encode(&mut frame);
    frame.extend_from_slice(body);
    let _ = out.send(frame);
}

/// Returns `false` when the connection should close.
fn process_frame(
    inner: &Arc<Inner>,
    conn_id: u64,
    session_id: i64,
    frame: &[u8],
    out: &Sender<Vec<u8>>,
) -> bool {
    let mut r = WireReader::new(frame);
    let Ok(header) = RequestHeader::decode(&mut r) else {
        return false;
    };
    let mut state = inner.state.lock().unwrap();
    let zxid_now = state.zxid;

    match OpCode::from_wire(header.opcode) {
        Some(OpCode::Ping) => {
            send_reply(out, PING_XID, zxid_now, 0, &[]);
        }
        Some(OpCode::Auth) => {
            let Ok(req) = AuthRequest::decode(&mut r) else {
                return false;
            };
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.auth = Some(Id::new(
                    req.scheme.clone(),
                    String::from_utf8_lossy(&req.auth).to_string(),
                ));
            }
            send_reply(out, AUTH_XID, zxid_now, 0, &[]);
        }
        Some(OpCode::Create) => {
            let Ok(req) = CreateRequest::decode(&mut r) else {
                return false;
            };
            let mut fires = Vec::new();
            match state.create(&req, session_id, &mut fires) {
                Ok(path) => {
                    state.fire(fires);
                    let mut body = Vec::new();
                    CreateResponse { path }.encode(&mut body);
                    let zxid = state.zxid;
                    send_reply(out, header.xid, zxid, 0, &body);
                }
                Err(code) => send_reply(out, header.xid, state.zxid, code, &[]),
            }
        }
        Some(OpCode::Delete) => {
            let Ok(req) = DeleteRequest::decode(&mut r) else {
                return false;
            };
            let mut fires = Vec::new();
            match state.delete(&req, &mut fires) {
                Ok(()) => {
                    state.fire(fires);
                    let zxid = state.zxid;
                    send_reply(out, header.xid, zxid, 0, &[]);
                }
                Err(code) => send_reply(out, header.xid, state.zxid, code, &[]),
            }
        }
        Some(OpCode::Exists) => {
            let Ok(req) = PathWatchRequest::decode(&mut r) else {
                return false;
            };
            if req.watch {
                state.arm_watch(WatchKind::Exists, &req.path, conn_id);
            }
            if state.tree.contains_key(&req.path) {
                let mut body = Vec::new();
                encode_stat(&mut body, &state.stat_of(&req.path));
                send_reply(out, header.xid, zxid_now, 0, &body);
            } else {
                send_reply(out, header.xid, zxid_now, ERR_NO_NODE, &[]);
            }
        }
        Some(OpCode::GetData) => {
            let Ok(req) = PathWatchRequest::decode(&mut r) else {
                return false;
            };
            if state.tree.contains_key(&req.path) {
                if req.watch {
                    state.arm_watch(WatchKind::Data, &req.path, conn_id);
                }
                let mut body = Vec::new();
                GetDataResponse {
                    data: state.tree[&req.path].data.clone(),
                    stat: state.stat_of(&req.path),
                }
                .encode(&mut body);
                send_reply(out, header.xid, zxid_now, 0, &body);
            } else {
                send_reply(out, header.xid, zxid_now, ERR_NO_NODE, &[]);
            }
        }
        Some(OpCode::SetData) => {
            let Ok(req) = SetDataRequest::decode(&mut r) else {
                return false;
            };
            let mut fires = Vec::new();
            match state.set_data(&req, &mut fires) {
                Ok(stat) => {
                    state.fire(fires);
                    let mut body = Vec::new();
                    StatResponse { stat }.encode(&mut body);
                    let zxid = state.zxid;
                    send_reply(out, header.xid, zxid, 0, &body);
                }
                Err(code) => send_reply(out, header.xid, state.zxid, code, &[]),
            }
        }
        Some(OpCode::GetChildren) | Some(OpCode::GetChildren2) => {
            let Ok(req) = PathWatchRequest::decode(&mut r) else {
                return false;
            };
            if state.tree.contains_key(&req.path) {
                if req.watch {
                    state.arm_watch(WatchKind::Child, &req.path, conn_id);
                }
                let mut body = Vec::new();
                let children = state.children_of(&req.path);
                if header.opcode == OpCode::GetChildren2.wire_value() {
                    GetChildren2Response {
                        children,
                        stat: state.stat_of(&req.path),
                    }
                    .encode(&mut body);
                } else {
                    GetChildrenResponse { children }.encode(&mut body);
                }
                send_reply(out, header.xid, zxid_now, 0, &body);
            } else {
                send_reply(out, header.xid, zxid_now, ERR_NO_NODE, &[]);
            }
        }
        Some(OpCode::GetAcl) => {
            let Ok(req) = PathRequest::decode(&mut r) else {
                return false;
            };
            if state.tree.contains_key(&req.path) {
                let mut body = Vec::new();
                GetAclResponse {
                    acl: state.tree[&req.path].acl.clone(),
                    stat: state.stat_of(&req.path),
                }
                .encode(&mut body);
                send_reply(out, header.xid, zxid_now, 0, &body);
            } else {
                send_reply(out, header.xid, zxid_now, ERR_NO_NODE, &[]);
            }
        }
        Some(OpCode::SetAcl) => {
            let Ok(req) = SetAclRequest::decode(&mut r) else {
                return false;
            };
            match state.tree.get(&req.path).map(|node| node.aversion) {
                None => send_reply(out, header.xid, zxid_now, ERR_NO_NODE, &[]),
                Some(aversion) if req.version != -1 && req.version != aversion => {
                    send_reply(out, header.xid, zxid_now, ERR_BAD_VERSION, &[]);
                }
                Some(_) => {
                    let node = state.tree.get_mut(&req.path).expect("checked above");
                    node.acl = req.acl.clone();
                    node.aversion += 1;
                    let mut body = Vec::new();
                    StatResponse {
                        stat: state.stat_of(&req.path),
                    }
                    .encode(&mut body);
                    send_reply(out, header.xid, zxid_now, 0, &body);
                }
            }
        }
        Some(OpCode::Sync) => {
            let Ok(req) = PathRequest::decode(&mut r) else {
                return false;
            };
            let mut body = Vec::new();
            PathResponse { path: req.path }.encode(&mut body);
            send_reply(out, header.xid, zxid_now, 0, &body);
        }
        Some(OpCode::SetWatches) => {
            let Ok(req) = SetWatchesRequest::decode(&mut r) else {
                return false;
            };
            for path in &req.data_watches {
                state.arm_watch(WatchKind::Data, path, conn_id);
            }
            for path in &req.exist_watches {
                state.arm_watch(WatchKind::Exists, path, conn_id);
            }
            for path in &req.child_watches {
                state.arm_watch(WatchKind::Child, path, conn_id);
            }
            send_reply(out, header.xid, zxid_now, 0, &[]);
        }
        Some(OpCode::Multi) => {
            let body = match apply_multi(&mut state, &mut r, session_id) {
                Ok(body) => body,
                Err(()) => return false,
            };
            let zxid = state.zxid;
            send_reply(out, header.xid, zxid, 0, &body);
        }
        Some(OpCode::CloseSession) => {
            state.sessions.remove(&session_id);
            state.reap_session(session_id);
            let zxid = state.zxid;
            send_reply(out, header.xid, zxid, 0, &[]);
            return false;
        }
        _ => {
            send_reply(out, header.xid, zxid_now, ERR_UNIMPLEMENTED, &[]);
        }
    }
    true
}

enum MultiOp {
    Create(CreateRequest),
    SetData(SetDataRequest),
    Check(CheckVersionRequest),
    Delete(DeleteRequest),
}

enum MultiOutcome {
    Create(String),
    SetData(Stat),
    Check,
    Delete,
}

fn apply_multi(
    state: &mut State,
    r: &mut WireReader<'_>,
    session_id: i64,
) -> Result<Vec<u8>, ()> {
    let mut ops = Vec::new();
    loop {
        let header = MultiHeader::decode(r).map_err(|_| ())?;
        if header.done {
            break;
        }
        let op = match OpCode::from_wire(header.op) {
            Some(OpCode::Create) => MultiOp::Create(CreateRequest::decode(r).map_err(|_| ())?),
            Some(OpCode::SetData) => MultiOp::SetData(SetDataRequest::decode(r).map_err(|_| ())?),
            Some(OpCode::Check) => {
                MultiOp::Check(CheckVersionRequest::decode(r).map_err(|_| ())?)
            }
            Some(OpCode::Delete) => MultiOp::Delete(DeleteRequest::decode(r).map_err(|_| ())?),
            _ => return Err(()),
        };
        ops.push(op);
    }

    // apply atomically: mutate, roll back wholesale on the first failure
    let snapshot = state.tree.clone();
    let mut fires = Vec::new();
    let mut outcomes = Vec::with_capacity(ops.len());
    let mut failure: Option<(usize, i32)> = None;
    for (index, op) in ops.iter().enumerate() {
        let result = match op {
            MultiOp::Create(req) => state
                .create(req, session_id, &mut fires)
                .map(MultiOutcome::Create),
            MultiOp::SetData(req) => state.set_data(req, &mut fires).map(MultiOutcome::SetData),
            MultiOp::Check(req) => state.check_version(req).map(|_| MultiOutcome::Check),
            MultiOp::Delete(req) => state.delete(req, &mut fires).map(|_| MultiOutcome::Delete),
        };
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(code) => {
                failure = Some((index, code));
                break;
            }
        }
    }

    let mut body = Vec::new();
    match failure {
        None => {
            state.fire(fires);
            for outcome in outcomes {
                match outcome {
                    MultiOutcome::Create(path) => {
                        MultiHeader {
                            op: OpCode::Create.wire_value(),
                            done: false,
                            err: 0,
                        }
                        .encode(&mut body);
                        CreateResponse { path }.encode(&mut body);
                    }
                    MultiOutcome::SetData(stat) => {
                        MultiHeader {
                            op: OpCode::SetData.wire_value(),
                            done: false,
                            err: 0,
                        }
                        .encode(&mut body);
                        StatResponse { stat }.encode(&mut body);
                    }
                    MultiOutcome::Check => {
                        MultiHeader {
                            op: OpCode::Check.wire_value(),
                            done: false,
                            err: 0,
                        }
                        .encode(&mut body);
                    }
                    MultiOutcome::Delete => {
                        MultiHeader {
                            op: OpCode::Delete.wire_value(),
                            done: false,
                            err: 0,
                        }
                        .encode(&mut body);
                    }
                }
            }
        }
        Some((failed_index, code)) => {
            state.tree = snapshot;
            for index in 0..ops.len() {
                let err = if index == failed_index {
                    code
                } else {
                    ERR_RUNTIME_INCONSISTENCY
                };
                MultiHeader {
                    op: -1,
                    done: false,
                    err,
                }
                .encode(&mut body);
                put_i32(&mut body, err);
            }
        }
    }
    MultiHeader::DONE.encode(&mut body);
    Ok(body)
}
