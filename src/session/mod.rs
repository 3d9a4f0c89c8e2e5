//! Session engine: one logical conversation across many TCP connections.

pub(crate) mod pending;
pub(crate) mod transport;
pub mod watch;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, TrySendError, after, at, bounded, never};
use thiserror::Error as ThisError;

use crate::config::{AuthInfo, SessionPolicy};
use crate::error::{Error, ErrorCode};
use crate::proto::frame::{FrameError, FrameReader, FrameWriter};
use crate::proto::records::{ConnectRequest, ConnectResponse, OpCode, SetWatchesRequest};
use crate::proto::wire::{WireError, WireReader};
use crate::session::pending::{PendingTable, QueuedRequest};
use crate::session::transport::{Control, Notice, Transport};
use crate::session::watch::WatchRegistry;
use crate::types::Acl;

/// Where the engine currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: the ensemble repudiated the session.
    Expired,
    /// Terminal: caller-requested shutdown or run deadline.
    Closed,
}

impl SessionPhase {
    fn as_u8(self) -> u8 {
        match self {
            SessionPhase::Disconnected => 0,
            SessionPhase::Connecting => 1,
            SessionPhase::Connected => 2,
            SessionPhase::Expired => 3,
            SessionPhase::Closed => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionPhase::Connecting,
            2 => SessionPhase::Connected,
            3 => SessionPhase::Expired,
            4 => SessionPhase::Closed,
            _ => SessionPhase::Disconnected,
        }
    }
}

/// Path prefix applied to every outgoing path and stripped from every
/// inbound one. The empty prefix means no chroot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Chroot {
    prefix: String,
}

impl Chroot {
    pub fn new(raw: &str) -> crate::Result<Self> {
        if raw.is_empty() || raw == "/" {
            return Ok(Self {
                prefix: String::new(),
            });
        }
        if !raw.starts_with('/') {
            return Err(Error::bad_arguments("chroot must start with '/'"));
        }
        if raw.ends_with('/') {
            return Err(Error::bad_arguments("chroot must not end with '/'"));
        }
        if raw.contains("//") {
            return Err(Error::bad_arguments("chroot must not contain empty components"));
        }
        Ok(Self {
            prefix: raw.to_string(),
        })
    }

    /// Normalizes a caller path and applies the prefix.
    pub fn add(&self, path: &str) -> crate::Result<String> {
        let normalized = normalize_path(path)?;
        if self.prefix.is_empty() {
            return Ok(normalized);
        }
        if normalized == "/" {
            Ok(self.prefix.clone())
        } else {
            Ok(format!("{}{}", self.prefix, normalized))
        }
    }

    /// Removes the prefix from a server path. Paths outside the prefix pass
    /// through untouched.
    pub fn strip(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            return path.to_string();
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => path.to_string(),
        }
    }
}

fn normalize_path(path: &str) -> crate::Result<String> {
    if path.is_empty() {
        return Err(Error::bad_arguments("path must not be empty"));
    }
    let normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if normalized.len() > 1 && normalized.ends_with('/') {
        return Err(Error::bad_arguments("path must not end with '/'"));
    }
    if normalized.contains("//") {
        return Err(Error::bad_arguments("path must not contain empty components"));
    }
    Ok(normalized)
}

/// State shared between the supervisor, the per-connection workers, and
/// caller threads. Tasks hold it by `Arc`, never by cyclic ownership.
#[derive(Debug)]
pub(crate) struct Shared {
    pub policy: SessionPolicy,
    pub endpoints: Vec<String>,
    pub auths: Vec<AuthInfo>,
    pub default_acl: Vec<Acl>,
    pub chroot: Chroot,
    pub request_tx: Sender<QueuedRequest>,
    pub request_rx: Receiver<QueuedRequest>,
    pub pending: PendingTable,
    pub watches: WatchRegistry,
    phase: AtomicU8,
    next_xid: AtomicI32,
    last_zxid: AtomicI64,
    epoch: Instant,
    last_send_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    stop_tx: Sender<()>,
    pub(crate) stop_rx: Receiver<()>,
    run_claimed: AtomicBool,
}

impl Shared {
    pub fn new(
        policy: SessionPolicy,
        endpoints: Vec<String>,
        auths: Vec<AuthInfo>,
        default_acl: Vec<Acl>,
        chroot: Chroot,
    ) -> Arc<Self> {
        let policy = policy.normalized();
        let (request_tx, request_rx) = bounded(policy.max_pending_operations);
        let (stop_tx, stop_rx) = bounded(1);
        Arc::new(Self {
            policy,
            endpoints,
            auths,
            default_acl,
            chroot,
            request_tx,
            request_rx,
            pending: PendingTable::default(),
            watches: WatchRegistry::default(),
            phase: AtomicU8::new(SessionPhase::Disconnected.as_u8()),
            next_xid: AtomicI32::new(1),
            last_zxid: AtomicI64::new(0),
            epoch: Instant::now(),
            last_send_ms: AtomicU64::new(0),
            last_recv_ms: AtomicU64::new(0),
            stop_tx,
            stop_rx,
            run_claimed: AtomicBool::new(false),
        })
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    /// Strictly increasing for the life of one connection; numbering resumes
    /// across reconnects since the counter is session-scoped.
    pub fn alloc_xid(&self) -> i32 {
        self.next_xid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn last_zxid(&self) -> i64 {
        self.last_zxid.load(Ordering::SeqCst)
    }

    pub fn set_last_zxid(&self, zxid: i64) {
        self.last_zxid.store(zxid, Ordering::SeqCst);
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn note_send(&self) {
        self.last_send_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    pub fn note_recv(&self) {
        self.last_recv_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    fn last_send_ms(&self) -> u64 {
        self.last_send_ms.load(Ordering::SeqCst)
    }

    fn last_recv_ms(&self) -> u64 {
        self.last_recv_ms.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Admits a caller request to the bounded queue, or fails synchronously.
    pub fn submit(&self, request: QueuedRequest) -> crate::Result<()> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        match self.request_tx.try_send(request) {
            Ok(()) => {
                // a terminal transition may have raced the enqueue; sweep so
                // the slot cannot be stranded
                if self.terminal_error().is_some() {
                    self.fail_queued();
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(Error::too_many_pending()),
            Err(TrySendError::Disconnected(_)) => Err(Error::connection_loss()),
        }
    }

    fn terminal_error(&self) -> Option<Error> {
        match self.phase() {
            SessionPhase::Expired => Some(Error::session_expired()),
            SessionPhase::Closed => Some(Error::connection_loss()),
            _ => None,
        }
    }

    /// Drains whatever sits in the request queue once the engine is
    /// terminal. Idempotent; callable from any thread.
    pub fn fail_queued(&self) {
        if let Some(err) = self.terminal_error() {
            for request in self.request_rx.try_iter() {
                let _ = request.reply_tx.send(Err(err.clone()));
            }
        }
    }
}

const TICK: Duration = Duration::from_millis(50);
const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(1);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

struct SessionIdent {
    session_id: i64,
    password: Vec<u8>,
    timeout: Duration,
}

enum Terminal {
    Canceled,
    DeadlineExceeded,
    Expired,
}

/// The engine's single long-running entry point. Returns the reason the
/// session ended: `Canceled`, `DeadlineExceeded` or `SessionExpired`.
pub(crate) fn run(shared: Arc<Shared>, deadline: Option<Instant>) -> Error {
    if shared.run_claimed.swap(true, Ordering::SeqCst) {
        return Error::new(
            ErrorCode::RuntimeInconsistency,
            "run already called for this session",
            false,
        );
    }

    let deadline_rx = match deadline {
        Some(instant) => at(instant),
        None => never(),
    };
    let mut ident = SessionIdent {
        session_id: 0,
        password: vec![0u8; 16],
        timeout: shared.policy.session_timeout(),
    };
    let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_MAX);
    let mut endpoint = 0usize;
    let mut backlog: Vec<QueuedRequest> = Vec::new();

    loop {
        shared.set_phase(SessionPhase::Connecting);
        let (transport, notice_rx) = 'sweep: loop {
            for _ in 0..shared.endpoints.len() {
                if shared.stop_rx.try_recv().is_ok() {
                    return finish(&shared, None, backlog, Terminal::Canceled);
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return finish(&shared, None, backlog, Terminal::DeadlineExceeded);
                }
                let addr = shared.endpoints[endpoint].clone();
                endpoint = (endpoint + 1) % shared.endpoints.len();
                match connect_once(&shared, &addr, &mut ident, &mut backlog) {
                    Ok(ConnectOutcome::Connected {
                        transport,
                        notice_rx,
                    }) => {
                        backoff.reset();
                        break 'sweep (transport, notice_rx);
                    }
                    Ok(ConnectOutcome::Repudiated) => {
                        tracing::warn!(
                            target: "zk::session",
                            session_id = ident.session_id,
                            "server repudiated the session"
                        );
                        return finish(&shared, None, backlog, Terminal::Expired);
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "zk::session",
                            addr = %addr,
                            "connect attempt failed: {err}"
                        );
                        cleanup_disconnect(&shared, &mut backlog);
                    }
                }
            }
            let timer = after(backoff.next_delay());
            let stop_rx = &shared.stop_rx;
            crossbeam::select! {
                recv(stop_rx) -> _ => return finish(&shared, None, backlog, Terminal::Canceled),
                recv(deadline_rx) -> _ => {
                    return finish(&shared, None, backlog, Terminal::DeadlineExceeded)
                }
                recv(timer) -> _ => {}
            }
        };

        shared.set_phase(SessionPhase::Connected);
        tracing::info!(
            target: "zk::session",
            session_id = ident.session_id,
            timeout_ms = ident.timeout.as_millis() as u64,
            "session connected"
        );
        let ping_interval = ident.timeout / 3;
        let idle_limit = ident.timeout * 2 / 3;

        loop {
            let tick = after(TICK);
            let stop_rx = &shared.stop_rx;
            crossbeam::select! {
                recv(stop_rx) -> _ => {
                    return finish(&shared, Some(transport), backlog, Terminal::Canceled)
                }
                recv(deadline_rx) -> _ => {
                    return finish(&shared, Some(transport), backlog, Terminal::DeadlineExceeded)
                }
                recv(notice_rx) -> notice => match notice {
                    Ok(Notice::Expired) => {
                        transport.stop();
                        return finish(&shared, None, backlog, Terminal::Expired);
                    }
                    Ok(Notice::Disconnected { why }) => {
                        tracing::warn!(target: "zk::session", "connection lost: {why}");
                        transport.stop();
                        cleanup_disconnect(&shared, &mut backlog);
                        break;
                    }
                    Err(_) => {
                        transport.stop();
                        cleanup_disconnect(&shared, &mut backlog);
                        break;
                    }
                },
                recv(tick) -> _ => {
                    let now = shared.now_ms();
                    if now.saturating_sub(shared.last_recv_ms())
                        > idle_limit.as_millis() as u64
                    {
                        tracing::warn!(
                            target: "zk::session",
                            "no traffic within the read deadline; reconnecting"
                        );
                        transport.stop();
                        cleanup_disconnect(&shared, &mut backlog);
                        break;
                    }
                    if now.saturating_sub(shared.last_send_ms())
                        >= ping_interval.as_millis() as u64
                    {
                        let _ = transport.control().send(Control::Ping);
                    }
                }
            }
        }
        shared.set_phase(SessionPhase::Disconnected);
    }
}

/// Fails or re-queues everything that was in flight when the connection
/// died. Auto-retry requests survive exactly one reconnect.
fn cleanup_disconnect(shared: &Shared, backlog: &mut Vec<QueuedRequest>) {
    for entry in shared.pending.drain() {
        let request = entry.request;
        if request.auto_retry && request.attempts < 2 {
            backlog.push(request);
        } else {
            let _ = request.reply_tx.send(Err(Error::connection_loss()));
        }
    }
}

fn finish(
    shared: &Shared,
    transport: Option<Transport>,
    backlog: Vec<QueuedRequest>,
    terminal: Terminal,
) -> Error {
    let phase = match terminal {
        Terminal::Expired => SessionPhase::Expired,
        Terminal::Canceled | Terminal::DeadlineExceeded => SessionPhase::Closed,
    };
    shared.set_phase(phase);

    if let Some(transport) = transport {
        let (done_tx, done_rx) = bounded(1);
        let _ = transport.control().send(Control::CloseSession { done: done_tx });
        let _ = done_rx.recv_timeout(CLOSE_FLUSH_TIMEOUT);
        transport.stop();
    }

    let err = match terminal {
        Terminal::Expired => Error::session_expired(),
        Terminal::Canceled | Terminal::DeadlineExceeded => Error::connection_loss(),
    };
    shared.pending.fail_all(&err);
    for request in backlog {
        let _ = request.reply_tx.send(Err(err.clone()));
    }
    shared.fail_queued();

    match terminal {
        Terminal::Expired => {
            shared.watches.expire();
            Error::session_expired()
        }
        Terminal::Canceled => {
            shared.watches.clear();
            Error::canceled()
        }
        Terminal::DeadlineExceeded => {
            shared.watches.clear();
            Error::deadline_exceeded()
        }
    }
}

enum ConnectOutcome {
    Connected {
        transport: Transport,
        notice_rx: Receiver<Notice>,
    },
    Repudiated,
}

#[derive(Debug, ThisError)]
enum ConnectError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("server closed the connection during handshake")]
    Closed,
}

/// Dials one endpoint, runs the synchronous handshake, replays auth and
/// armed watches, resubmits the auto-retry backlog, then hands the socket to
/// the workers. Caller traffic only flows once all of that is on the wire.
fn connect_once(
    shared: &Arc<Shared>,
    addr: &str,
    ident: &mut SessionIdent,
    backlog: &mut Vec<QueuedRequest>,
) -> Result<ConnectOutcome, ConnectError> {
    let attempt = connect_attempt_timeout(ident.timeout, shared.endpoints.len());
    let socket = transport::dial(addr, attempt)?;
    socket.set_nodelay(true)?;
    socket.set_read_timeout(Some(attempt))?;

    let mut writer = FrameWriter::new(socket.try_clone()?, shared.policy.max_frame_bytes);
    let mut reader = FrameReader::new(socket.try_clone()?, shared.policy.max_frame_bytes);

    let request = ConnectRequest {
        protocol_version: 0,
        last_zxid_seen: shared.last_zxid(),
        timeout_ms: ident.timeout.as_millis() as i32,
        session_id: ident.session_id,
        password: ident.password.clone(),
    };
    let mut body = Vec::new();
    request.encode(&mut body);
    writer.write_frame(&body)?;

    let frame = reader.read_next()?.ok_or(ConnectError::Closed)?;
    let mut r = WireReader::new(&frame);
    let response = ConnectResponse::decode(&mut r)?;
    if response.session_id == 0 {
        return Ok(ConnectOutcome::Repudiated);
    }
    socket.set_read_timeout(None)?;

    let resumed = ident.session_id != 0;
    ident.session_id = response.session_id;
    ident.password = response.password;
    if response.timeout_ms > 0 {
        ident.timeout = Duration::from_millis(response.timeout_ms as u64);
    }
    shared.note_send();
    shared.note_recv();
    tracing::debug!(
        target: "zk::session",
        session_id = ident.session_id,
        resumed,
        negotiated_timeout_ms = response.timeout_ms,
        "handshake complete"
    );

    for auth in &shared.auths {
        transport::write_auth(&mut writer, shared, auth)?;
    }

    if let Some(lists) = shared.watches.set_watches() {
        let request = SetWatchesRequest {
            relative_zxid: shared.last_zxid(),
            data_watches: lists.data,
            exist_watches: lists.exists,
            child_watches: lists.child,
        };
        let mut body = Vec::new();
        request.encode(&mut body);
        // reply slot intentionally dropped: the reply is consumed through
        // the pending table for ordering and then discarded
        let (reply_tx, _discard) = bounded(1);
        transport::write_request(
            &mut writer,
            shared,
            QueuedRequest {
                opcode: OpCode::SetWatches,
                payload: body,
                reply_tx,
                watch: None,
                auto_retry: false,
                attempts: 0,
            },
        )?;
    }

    while !backlog.is_empty() {
        let request = backlog.remove(0);
        transport::write_request(&mut writer, shared, request)?;
    }

    let (transport, notice_rx) = Transport::start(socket, reader, writer, Arc::clone(shared));
    Ok(ConnectOutcome::Connected {
        transport,
        notice_rx,
    })
}

fn connect_attempt_timeout(session_timeout: Duration, endpoints: usize) -> Duration {
    let attempt = session_timeout / (2 * endpoints.max(1)) as u32;
    attempt.max(Duration::from_millis(100))
}

struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = next.min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}
