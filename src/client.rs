//! Typed operation façade over the session engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, at, bounded, never};

use crate::config::{AuthInfo, SessionPolicy};
use crate::error::{Error, ErrorCode};
use crate::proto::records::{
    CheckVersionRequest, CreateRequest, CreateResponse, DeleteRequest, GetAclResponse,
    GetChildren2Response, GetChildrenResponse, GetDataResponse, MultiHeader, OpCode, PathRequest,
    PathResponse, PathWatchRequest, SetAclRequest, SetDataRequest, StatResponse,
};
use crate::proto::wire::WireReader;
use crate::session::pending::{QueuedRequest, Reply, ReplyResult};
use crate::session::watch::{WatchArm, WatchKind, Watcher};
use crate::session::{self, Chroot, SessionPhase, Shared};
use crate::types::{Acl, CreateMode, OpResult, Stat, open_acl_unsafe};

/// Deadline and cancellation signal honored at every caller suspension
/// point. Cancelling only abandons the wait: an already-written frame still
/// reaches the server and its reply is discarded, so server state and reply
/// ordering stay consistent.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: Option<Receiver<()>>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context plus the handle that cancels it.
    pub fn cancelable() -> (Self, CancelHandle) {
        let (tx, rx) = bounded(1);
        (
            Self {
                deadline: None,
                cancel: Some(rx),
            },
            CancelHandle { tx },
        )
    }

    /// Adds a deadline to an existing (possibly cancelable) context.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.try_send(());
    }
}

/// One element of a [`Client::multi`] transaction.
#[derive(Clone, Debug)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        acl: Option<Vec<Acl>>,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: i32,
    },
    Check {
        path: String,
        version: i32,
    },
    Delete {
        path: String,
        version: i32,
    },
}

impl Op {
    pub fn create(
        path: impl Into<String>,
        data: impl Into<Vec<u8>>,
        acl: Option<Vec<Acl>>,
        mode: CreateMode,
    ) -> Self {
        Op::Create {
            path: path.into(),
            data: data.into(),
            acl,
            mode,
        }
    }

    pub fn set_data(path: impl Into<String>, data: impl Into<Vec<u8>>, version: i32) -> Self {
        Op::SetData {
            path: path.into(),
            data: data.into(),
            version,
        }
    }

    pub fn check(path: impl Into<String>, version: i32) -> Self {
        Op::Check {
            path: path.into(),
            version,
        }
    }

    pub fn delete(path: impl Into<String>, version: i32) -> Self {
        Op::Delete {
            path: path.into(),
            version,
        }
    }

    fn opcode(&self) -> OpCode {
        match self {
            Op::Create { .. } => OpCode::Create,
            Op::SetData { .. } => OpCode::SetData,
            Op::Check { .. } => OpCode::Check,
            Op::Delete { .. } => OpCode::Delete,
        }
    }
}

/// Handle to one logical session. Cheap to clone; all clones share the same
/// engine. One thread calls [`Client::run`]; any number of threads submit
/// operations concurrently.
#[derive(Clone, Debug)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Builds a client for the given ensemble. `chroot` of `"/"` (or `""`)
    /// means no prefix. An empty `default_acl` falls back to
    /// [`open_acl_unsafe`].
    pub fn new(
        policy: SessionPolicy,
        servers: Vec<String>,
        auths: Vec<AuthInfo>,
        default_acl: Vec<Acl>,
        chroot: &str,
    ) -> crate::Result<Self> {
        if servers.is_empty() {
            return Err(Error::bad_arguments("server address list must not be empty"));
        }
        let chroot = Chroot::new(chroot)?;
        let default_acl = if default_acl.is_empty() {
            open_acl_unsafe()
        } else {
            default_acl
        };
        Ok(Self {
            shared: Shared::new(policy, servers, auths, default_acl, chroot),
        })
    }

    /// Runs the session engine until the session ends and returns the
    /// reason: `Canceled` after [`Client::stop`], or `SessionExpired` when
    /// the ensemble repudiates the session. Must be called exactly once per
    /// client.
    pub fn run(&self) -> Error {
        session::run(Arc::clone(&self.shared), None)
    }

    /// Like [`Client::run`] but also terminates with `DeadlineExceeded`
    /// once `deadline` passes.
    pub fn run_until(&self, deadline: Instant) -> Error {
        session::run(Arc::clone(&self.shared), Some(deadline))
    }

    /// Asks a concurrent [`Client::run`] to wind the session down; it will
    /// return `Canceled`. Safe to call before `run` and more than once.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    /// Creates a node. Returns the server-assigned path, which differs from
    /// the requested one for sequential modes.
    pub fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: Option<&[Acl]>,
        mode: CreateMode,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<String> {
        let server_path = self.shared.chroot.add(path)?;
        let request = CreateRequest {
            path: server_path,
            data: data.to_vec(),
            acl: self.effective_acl(acl),
            flags: mode.flags(),
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        let reply = self.submit_op(OpCode::Create, body, None, auto_retry, ctx)?;
        let response = decode_body(&reply, CreateResponse::decode)?;
        Ok(self.shared.chroot.strip(&response.path))
    }

    /// Deletes a node; `version == -1` skips the version guard.
    pub fn delete(
        &self,
        path: &str,
        version: i32,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<()> {
        let request = DeleteRequest {
            path: self.shared.chroot.add(path)?,
            version,
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        self.submit_op(OpCode::Delete, body, None, auto_retry, ctx)?;
        Ok(())
    }

    /// Returns the node's `Stat`, or `None` if it does not exist.
    pub fn exists(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<Option<Stat>> {
        self.exists_inner(path, None, auto_retry, ctx)
    }

    /// Like [`Client::exists`], and also leaves a watch behind. The watch
    /// fires on create or delete whether or not the node currently exists.
    pub fn exists_w(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<(Option<Stat>, Watcher)> {
        let (tx, rx) = bounded(1);
        let stat = self.exists_inner(path, Some(tx), auto_retry, ctx)?;
        Ok((stat, Watcher::new(rx)))
    }

    fn exists_inner(
        &self,
        path: &str,
        watch_tx: Option<Sender<crate::types::WatchedEvent>>,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<Option<Stat>> {
        let server_path = self.shared.chroot.add(path)?;
        let request = PathWatchRequest {
            path: server_path.clone(),
            watch: watch_tx.is_some(),
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        let watch = watch_tx.map(|tx| WatchArm {
            kind: WatchKind::Exists,
            path: server_path,
            tx,
            arm_on_no_node: true,
        });
        match self.submit_op(OpCode::Exists, body, watch, auto_retry, ctx) {
            Ok(reply) => {
                let response = decode_body(&reply, StatResponse::decode)?;
                Ok(Some(response.stat))
            }
            Err(err) if err.code() == ErrorCode::NoNode => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn get_data(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<(Vec<u8>, Stat)> {
        self.get_data_inner(path, None, auto_retry, ctx)
    }

    /// Like [`Client::get_data`]; the watch fires on a data change or
    /// delete.
    pub fn get_data_w(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<(Vec<u8>, Stat, Watcher)> {
        let (tx, rx) = bounded(1);
        let (data, stat) = self.get_data_inner(path, Some(tx), auto_retry, ctx)?;
        Ok((data, stat, Watcher::new(rx)))
    }

    fn get_data_inner(
        &self,
        path: &str,
        watch_tx: Option<Sender<crate::types::WatchedEvent>>,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<(Vec<u8>, Stat)> {
        let server_path = self.shared.chroot.add(path)?;
        let request = PathWatchRequest {
            path: server_path.clone(),
            watch: watch_tx.is_some(),
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        let watch = watch_tx.map(|tx| WatchArm {
            kind: WatchKind::Data,
            path: server_path,
            tx,
            arm_on_no_node: false,
        });
        let reply = self.submit_op(OpCode::GetData, body, watch, auto_retry, ctx)?;
        let response = decode_body(&reply, GetDataResponse::decode)?;
        Ok((response.data, response.stat))
    }

    pub fn set_data(
        &self,
        path: &str,
        data: &[u8],
        version: i32,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<Stat> {
        let request = SetDataRequest {
            path: self.shared.chroot.add(path)?,
            data: data.to_vec(),
            version,
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        let reply = self.submit_op(OpCode::SetData, body, None, auto_retry, ctx)?;
        Ok(decode_body(&reply, StatResponse::decode)?.stat)
    }

    pub fn get_children(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<Vec<String>> {
        let reply = self.children_inner(path, None, OpCode::GetChildren, auto_retry, ctx)?;
        Ok(decode_body(&reply, GetChildrenResponse::decode)?.children)
    }

    /// Like [`Client::get_children`]; the watch fires on any child add or
    /// remove and on deletion of this node.
    pub fn get_children_w(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<(Vec<String>, Watcher)> {
        let (tx, rx) = bounded(1);
        let reply = self.children_inner(path, Some(tx), OpCode::GetChildren, auto_retry, ctx)?;
        let response = decode_body(&reply, GetChildrenResponse::decode)?;
        Ok((response.children, Watcher::new(rx)))
    }

    pub fn get_children2(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<(Vec<String>, Stat)> {
        let reply = self.children_inner(path, None, OpCode::GetChildren2, auto_retry, ctx)?;
        let response = decode_body(&reply, GetChildren2Response::decode)?;
        Ok((response.children, response.stat))
    }

    pub fn get_children2_w(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<(Vec<String>, Stat, Watcher)> {
        let (tx, rx) = bounded(1);
        let reply = self.children_inner(path, Some(tx), OpCode::GetChildren2, auto_retry, ctx)?;
        let response = decode_body(&reply, GetChildren2Response::decode)?;
        Ok((response.children, response.stat, Watcher::new(rx)))
    }

    fn children_inner(
        &self,
        path: &str,
        watch_tx: Option<Sender<crate::types::WatchedEvent>>,
        opcode: OpCode,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<Reply> {
        let server_path = self.shared.chroot.add(path)?;
        let request = PathWatchRequest {
            path: server_path.clone(),
            watch: watch_tx.is_some(),
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        let watch = watch_tx.map(|tx| WatchArm {
            kind: WatchKind::Child,
            path: server_path,
            tx,
            arm_on_no_node: false,
        });
        self.submit_op(opcode, body, watch, auto_retry, ctx)
    }

    pub fn get_acl(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<(Vec<Acl>, Stat)> {
        let request = PathRequest {
            path: self.shared.chroot.add(path)?,
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        let reply = self.submit_op(OpCode::GetAcl, body, None, auto_retry, ctx)?;
        let response = decode_body(&reply, GetAclResponse::decode)?;
        Ok((response.acl, response.stat))
    }

    pub fn set_acl(
        &self,
        path: &str,
        acl: &[Acl],
        version: i32,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<Stat> {
        let request = SetAclRequest {
            path: self.shared.chroot.add(path)?,
            acl: acl.to_vec(),
            version,
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        let reply = self.submit_op(OpCode::SetAcl, body, None, auto_retry, ctx)?;
        Ok(decode_body(&reply, StatResponse::decode)?.stat)
    }

    /// Forces the connected server to catch up to the quorum leader for
    /// `path`.
    pub fn sync(
        &self,
        path: &str,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<String> {
        let request = PathRequest {
            path: self.shared.chroot.add(path)?,
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        let reply = self.submit_op(OpCode::Sync, body, None, auto_retry, ctx)?;
        let response = decode_body(&reply, PathResponse::decode)?;
        Ok(self.shared.chroot.strip(&response.path))
    }

    /// Runs `ops` as one atomic transaction. On failure every slot is
    /// `OpResult::Error`: the first failing op carries the real cause, the
    /// others `RuntimeInconsistency`.
    pub fn multi(
        &self,
        ops: &[Op],
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<Vec<OpResult>> {
        if ops.is_empty() {
            return Err(Error::bad_arguments("multi requires at least one op"));
        }
        let mut body = Vec::new();
        let mut shapes = Vec::with_capacity(ops.len());
        for op in ops {
            shapes.push(op.opcode());
            MultiHeader {
                op: op.opcode().wire_value(),
                done: false,
                err: -1,
            }
            .encode(&mut body);
            self.encode_multi_op(op, &mut body)?;
        }
        MultiHeader::DONE.encode(&mut body);

        let reply = self.submit_op(OpCode::Multi, body, None, auto_retry, ctx)?;
        self.decode_multi_results(&reply, &shapes)
    }

    fn encode_multi_op(&self, op: &Op, body: &mut Vec<u8>) -> crate::Result<()> {
        match op {
            Op::Create {
                path,
                data,
                acl,
                mode,
            } => CreateRequest {
                path: self.shared.chroot.add(path)?,
                data: data.clone(),
                acl: self.effective_acl(acl.as_deref()),
                flags: mode.flags(),
            }
            .encode(body),
            Op::SetData {
                path,
                data,
                version,
            } => SetDataRequest {
                path: self.shared.chroot.add(path)?,
                data: data.clone(),
                version: *version,
            }
            .encode(body),
            Op::Check { path, version } => CheckVersionRequest {
                path: self.shared.chroot.add(path)?,
                version: *version,
            }
            .encode(body),
            Op::Delete { path, version } => DeleteRequest {
                path: self.shared.chroot.add(path)?,
                version: *version,
            }
            .encode(body),
        }
        Ok(())
    }

    fn decode_multi_results(
        &self,
        reply: &Reply,
        shapes: &[OpCode],
    ) -> crate::Result<Vec<OpResult>> {
        let mut r = WireReader::new(&reply.body);
        let mut results = Vec::with_capacity(shapes.len());
        loop {
            let header = MultiHeader::decode(&mut r).map_err(Error::from)?;
            if header.done {
                break;
            }
            if header.op == -1 {
                let raw = r.read_i32("multi.errorResult").map_err(Error::from)?;
                let code = ErrorCode::from_wire(raw).unwrap_or(ErrorCode::SystemError);
                results.push(OpResult::Error(code));
                continue;
            }
            let result = match OpCode::from_wire(header.op) {
                Some(OpCode::Create) => {
                    let response =
                        CreateResponse::decode(&mut r).map_err(Error::from)?;
                    OpResult::Create {
                        path: self.shared.chroot.strip(&response.path),
                    }
                }
                Some(OpCode::SetData) => {
                    let response = StatResponse::decode(&mut r).map_err(Error::from)?;
                    OpResult::SetData {
                        stat: response.stat,
                    }
                }
                Some(OpCode::Check) => OpResult::Check,
                Some(OpCode::Delete) => OpResult::Delete,
                _ => {
                    return Err(Error::new(
                        ErrorCode::MarshallingError,
                        format!("unexpected multi result type {}", header.op),
                        false,
                    ));
                }
            };
            results.push(result);
        }
        if results.len() != shapes.len() {
            return Err(Error::new(
                ErrorCode::MarshallingError,
                format!(
                    "multi returned {} results for {} ops",
                    results.len(),
                    shapes.len()
                ),
                false,
            ));
        }
        Ok(results)
    }

    fn effective_acl(&self, acl: Option<&[Acl]>) -> Vec<Acl> {
        match acl {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => self.shared.default_acl.clone(),
        }
    }

    fn submit_op(
        &self,
        opcode: OpCode,
        payload: Vec<u8>,
        watch: Option<WatchArm>,
        auto_retry: bool,
        ctx: Option<&OpContext>,
    ) -> crate::Result<Reply> {
        let (reply_tx, reply_rx) = bounded(1);
        self.shared.submit(QueuedRequest {
            opcode,
            payload,
            reply_tx,
            watch,
            auto_retry,
            attempts: 0,
        })?;
        await_reply(reply_rx, ctx)
    }
}

fn await_reply(reply_rx: Receiver<ReplyResult>, ctx: Option<&OpContext>) -> crate::Result<Reply> {
    let deadline_rx = match ctx.and_then(|c| c.deadline) {
        Some(deadline) => at(deadline),
        None => never(),
    };
    let mut cancel_rx = match ctx.and_then(|c| c.cancel.clone()) {
        Some(rx) => rx,
        None => never(),
    };
    loop {
        crossbeam::select! {
            recv(reply_rx) -> result => {
                return match result {
                    Ok(result) => result,
                    // the engine dropped the slot without answering
                    Err(_) => Err(Error::connection_loss()),
                };
            }
            recv(deadline_rx) -> _ => return Err(Error::deadline_exceeded()),
            recv(cancel_rx) -> signal => match signal {
                Ok(()) => return Err(Error::canceled()),
                // the cancel handle was dropped un-fired; wait normally
                Err(_) => cancel_rx = never(),
            },
        }
    }
}

fn decode_body<T>(
    reply: &Reply,
    decode: impl FnOnce(&mut WireReader<'_>) -> Result<T, crate::proto::wire::WireError>,
) -> crate::Result<T> {
    let mut r = WireReader::new(&reply.body);
    decode(&mut r).map_err(Error::from)
}
