//! One TCP connection: dial, reader and writer workers, tear-down.

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

use crate::config::AuthInfo;
use crate::error::{Error, ErrorCode};
use crate::proto::frame::{FrameError, FrameReader, FrameWriter};
use crate::proto::records::{
    AUTH_XID, AuthRequest, NOTIFICATION_XID, OpCode, PING_XID, ReplyHeader, WatcherEvent,
    encode_request_frame,
};
use crate::proto::wire::WireReader;
use crate::session::Shared;
use crate::session::pending::{PendingEntry, QueuedRequest, Reply};
use crate::types::{EventType, KeeperState, WatchedEvent};

/// Out-of-band commands for the writer worker.
pub(crate) enum Control {
    Ping,
    /// Best-effort close frame; `done` is signalled once it has been written
    /// so the supervisor can tear the socket down without racing it.
    CloseSession { done: Sender<()> },
}

/// Connection-fatal conditions reported to the supervisor.
#[derive(Debug)]
pub(crate) enum Notice {
    Disconnected { why: String },
    Expired,
}

/// A live connection with its two workers. Dropping the control sender and
/// shutting the socket down terminates both; `stop` does exactly that and
/// joins them.
pub(crate) struct Transport {
    socket: TcpStream,
    control_tx: Sender<Control>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Transport {
    pub fn start(
        socket: TcpStream,
        frame_reader: FrameReader<TcpStream>,
        frame_writer: FrameWriter<TcpStream>,
        shared: Arc<Shared>,
    ) -> (Self, Receiver<Notice>) {
        let (notice_tx, notice_rx) = unbounded();
        let (control_tx, control_rx) = bounded(8);

        let reader_shared = Arc::clone(&shared);
        let reader_notice = notice_tx.clone();
        let reader =
            thread::spawn(move || run_reader(frame_reader, reader_shared, reader_notice));

        let writer = thread::spawn(move || run_writer(frame_writer, shared, control_rx, notice_tx));

        (
            Self {
                socket,
                control_tx,
                reader,
                writer,
            },
            notice_rx,
        )
    }

    pub fn control(&self) -> &Sender<Control> {
        &self.control_tx
    }

    /// Idempotent tear-down: kill the socket, release the writer, join both
    /// workers.
    pub fn stop(self) {
        let Transport {
            socket,
            control_tx,
            reader,
            writer,
        } = self;
        let _ = socket.shutdown(Shutdown::Both);
        drop(control_tx);
        let _ = writer.join();
        let _ = reader.join();
    }
}

/// Resolves and dials one endpoint within the per-attempt deadline.
pub(crate) fn dial(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for sockaddr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sockaddr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}

/// Commits one caller request: assigns its XID, inserts the pending entry,
/// writes the frame. Insertion precedes the write so a reply can never beat
/// its own bookkeeping.
pub(crate) fn write_request(
    writer: &mut FrameWriter<TcpStream>,
    shared: &Shared,
    mut request: QueuedRequest,
) -> Result<(), FrameError> {
    let xid = shared.alloc_xid();
    request.attempts += 1;
    let opcode = request.opcode;
    let frame = encode_request_frame(xid, opcode, &request.payload);
    shared.pending.push(PendingEntry { xid, request });
    writer.write_frame(&frame)?;
    shared.note_send();
    tracing::trace!(target: "zk::transport", xid, ?opcode, "request written");
    Ok(())
}

pub(crate) fn write_auth(
    writer: &mut FrameWriter<TcpStream>,
    shared: &Shared,
    auth: &AuthInfo,
) -> Result<(), FrameError> {
    let mut body = Vec::new();
    AuthRequest {
        auth_type: 0,
        scheme: auth.scheme.clone(),
        auth: auth.auth.clone(),
    }
    .encode(&mut body);
    let frame = encode_request_frame(AUTH_XID, OpCode::Auth, &body);
    writer.write_frame(&frame)?;
    shared.note_send();
    Ok(())
}

fn run_writer(
    mut writer: FrameWriter<TcpStream>,
    shared: Arc<Shared>,
    control_rx: Receiver<Control>,
    notice_tx: Sender<Notice>,
) {
    let request_rx = shared.request_rx.clone();
    loop {
        crossbeam::select! {
            recv(control_rx) -> msg => match msg {
                Ok(Control::Ping) => {
                    let frame = encode_request_frame(PING_XID, OpCode::Ping, &[]);
                    if let Err(err) = writer.write_frame(&frame) {
                        let _ = notice_tx.send(Notice::Disconnected {
                            why: format!("ping write failed: {err}"),
                        });
                        break;
                    }
                    shared.note_send();
                }
                Ok(Control::CloseSession { done }) => {
                    let frame =
                        encode_request_frame(shared.alloc_xid(), OpCode::CloseSession, &[]);
                    if let Err(err) = writer.write_frame(&frame) {
                        tracing::debug!(
                            target: "zk::transport",
                            "close session write failed: {err}"
                        );
                    }
                    let _ = done.send(());
                    break;
                }
                Err(_) => break,
            },
            recv(request_rx) -> msg => match msg {
                Ok(request) => {
                    if let Err(err) = write_request(&mut writer, &shared, request) {
                        let _ = notice_tx.send(Notice::Disconnected {
                            why: format!("request write failed: {err}"),
                        });
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}

fn run_reader(
    mut reader: FrameReader<TcpStream>,
    shared: Arc<Shared>,
    notice_tx: Sender<Notice>,
) {
    loop {
        let frame = match reader.read_next() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let _ = notice_tx.send(Notice::Disconnected {
                    why: "server closed the connection".into(),
                });
                break;
            }
            Err(err) => {
                let _ = notice_tx.send(Notice::Disconnected {
                    why: format!("read failed: {err}"),
                });
                break;
            }
        };
        shared.note_recv();

        let mut r = WireReader::new(&frame);
        let header = match ReplyHeader::decode(&mut r) {
            Ok(header) => header,
            Err(err) => {
                let _ = notice_tx.send(Notice::Disconnected {
                    why: format!("corrupt reply header: {err}"),
                });
                break;
            }
        };
        if header.zxid > 0 {
            shared.set_last_zxid(header.zxid);
        }

        match header.xid {
            PING_XID => {}
            NOTIFICATION_XID => match WatcherEvent::decode(&mut r) {
                Ok(event) => handle_notification(&shared, event),
                Err(err) => {
                    let _ = notice_tx.send(Notice::Disconnected {
                        why: format!("corrupt notification: {err}"),
                    });
                    break;
                }
            },
            AUTH_XID => {
                if header.err != 0 {
                    tracing::warn!(
                        target: "zk::session",
                        err = header.err,
                        "authentication rejected by server"
                    );
                }
            }
            xid => {
                if Some(header.err) == ErrorCode::SessionExpired.wire_code() {
                    if let Ok(entry) = shared.pending.take_head(xid) {
                        let _ = entry.request.reply_tx.send(Err(Error::session_expired()));
                    }
                    let _ = notice_tx.send(Notice::Expired);
                    break;
                }
                match shared.pending.take_head(xid) {
                    Ok(entry) => deliver_reply(&shared, entry, &header, r.take_rest()),
                    Err(mismatch) => {
                        tracing::warn!(target: "zk::transport", "{mismatch}; forcing reconnect");
                        let _ = notice_tx.send(Notice::Disconnected {
                            why: mismatch.to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }
}

fn handle_notification(shared: &Shared, event: WatcherEvent) {
    let Some(event_type) = EventType::from_wire(event.event_type) else {
        tracing::warn!(
            target: "zk::watch",
            raw = event.event_type,
            "unknown event type; dropping notification"
        );
        return;
    };
    let state = KeeperState::from_wire(event.state).unwrap_or(KeeperState::SyncConnected);
    let delivered = WatchedEvent {
        event_type,
        state,
        path: shared.chroot.strip(&event.path),
    };
    tracing::debug!(
        target: "zk::watch",
        path = %event.path,
        event_type = ?event_type,
        "notification"
    );
    shared.watches.dispatch(event_type, &event.path, &delivered);
}

fn deliver_reply(shared: &Shared, entry: PendingEntry, header: &ReplyHeader, body: &[u8]) {
    let request = entry.request;
    if let Some(arm) = request.watch {
        let armed = header.err == 0
            || (arm.arm_on_no_node && Some(header.err) == ErrorCode::NoNode.wire_code());
        if armed {
            shared.watches.arm(arm.kind, &arm.path, arm.tx);
        }
    }
    let result = if header.err == 0 {
        Ok(Reply {
            zxid: header.zxid,
            body: body.to_vec(),
        })
    } else {
        Err(Error::protocol(header.err))
    };
    let _ = request.reply_tx.send(result);
}
