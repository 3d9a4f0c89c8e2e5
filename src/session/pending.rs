//! In-flight request bookkeeping.

use std::collections::VecDeque;
use std::sync::Mutex;

use crossbeam::channel::Sender;
use thiserror::Error as ThisError;

use crate::error::Error;
use crate::proto::records::OpCode;
use crate::session::watch::WatchArm;

/// Outcome handed to the caller's reply slot.
pub(crate) type ReplyResult = crate::Result<Reply>;

/// A successful reply: the transaction id from the header plus the
/// still-encoded body, decoded by the operation façade.
#[derive(Clone, Debug)]
pub(crate) struct Reply {
    pub zxid: i64,
    pub body: Vec<u8>,
}

/// One admitted caller request, queued or in flight.
#[derive(Clone, Debug)]
pub(crate) struct QueuedRequest {
    pub opcode: OpCode,
    /// Encoded request body, chroot already applied. Retained so an
    /// auto-retry survivor can be rewritten verbatim after a reconnect.
    pub payload: Vec<u8>,
    pub reply_tx: Sender<ReplyResult>,
    pub watch: Option<WatchArm>,
    pub auto_retry: bool,
    /// How many connections this request has been written on.
    pub attempts: u32,
}

#[derive(Debug)]
pub(crate) struct PendingEntry {
    pub xid: i32,
    pub request: QueuedRequest,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("reply xid {got} does not match head xid {expected:?}")]
pub(crate) struct XidMismatch {
    pub expected: Option<i32>,
    pub got: i32,
}

/// FIFO of outstanding requests, guarded by one mutex.
///
/// The head's XID always equals the next reply's XID; anything else is a
/// protocol violation surfaced as [`XidMismatch`].
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    inner: Mutex<VecDeque<PendingEntry>>,
}

impl PendingTable {
    pub fn push(&self, entry: PendingEntry) {
        self.inner.lock().expect("pending table poisoned").push_back(entry);
    }

    /// Removes and returns the head entry iff its XID matches the reply.
    pub fn take_head(&self, xid: i32) -> Result<PendingEntry, XidMismatch> {
        let mut inner = self.inner.lock().expect("pending table poisoned");
        match inner.front() {
            Some(head) if head.xid == xid => Ok(inner.pop_front().expect("head present")),
            Some(head) => Err(XidMismatch {
                expected: Some(head.xid),
                got: xid,
            }),
            None => Err(XidMismatch {
                expected: None,
                got: xid,
            }),
        }
    }

    pub fn drain(&self) -> Vec<PendingEntry> {
        let mut inner = self.inner.lock().expect("pending table poisoned");
        inner.drain(..).collect()
    }

    /// Fails every outstanding entry with `err`.
    pub fn fail_all(&self, err: &Error) {
        for entry in self.drain() {
            let _ = entry.request.reply_tx.send(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
