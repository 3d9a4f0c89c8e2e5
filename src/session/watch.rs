//! Watch registry: (kind, path) → one-shot waiters, reconnect re-arming.

use std::sync::Mutex;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::types::{EventType, KeeperState, WatchedEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WatchKind {
    Data,
    Exists,
    Child,
}

/// A watch riding along with a caller request, armed by the reader once the
/// server has accepted the request.
#[derive(Clone, Debug)]
pub(crate) struct WatchArm {
    pub kind: WatchKind,
    /// Chroot-prefixed path, the key the server will notify under.
    pub path: String,
    pub tx: Sender<WatchedEvent>,
    /// Exists watches are armed even when the node is absent.
    pub arm_on_no_node: bool,
}

/// Caller-side handle for a single armed watch. Delivers at most one event.
#[derive(Debug)]
pub struct Watcher {
    rx: Receiver<WatchedEvent>,
}

impl Watcher {
    pub(crate) fn new(rx: Receiver<WatchedEvent>) -> Self {
        Self { rx }
    }

    /// The underlying delivery channel, for use in `select!` loops.
    pub fn event(&self) -> &Receiver<WatchedEvent> {
        &self.rx
    }

    pub fn try_recv(&self) -> Result<WatchedEvent, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<WatchedEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// The watch lists re-armed on the server after a reconnect.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SetWatchesLists {
    pub data: Vec<String>,
    pub exists: Vec<String>,
    pub child: Vec<String>,
}

#[derive(Debug)]
struct ArmedKey {
    kind: WatchKind,
    path: String,
    waiters: Vec<Sender<WatchedEvent>>,
}

/// Armed watches, insertion-ordered so re-arming preserves registration
/// order. Guarded by one mutex; senders never block (capacity-one one-shot
/// channels), so the reader cannot stall on a slow consumer.
#[derive(Debug, Default)]
pub(crate) struct WatchRegistry {
    inner: Mutex<Vec<ArmedKey>>,
}

impl WatchRegistry {
    /// Registers a waiter; waiters on the same key share one server-side
    /// registration.
    pub fn arm(&self, kind: WatchKind, path: &str, tx: Sender<WatchedEvent>) {
        let mut inner = self.inner.lock().expect("watch registry poisoned");
        if let Some(key) = inner
            .iter_mut()
            .find(|key| key.kind == kind && key.path == path)
        {
            key.waiters.push(tx);
            return;
        }
        inner.push(ArmedKey {
            kind,
            path: path.to_string(),
            waiters: vec![tx],
        });
    }

    /// Fans a server event out to every waiter on the affected keys and
    /// removes those keys. `server_path` is the chroot-prefixed key;
    /// `delivered` already carries the caller-visible path.
    pub fn dispatch(&self, event_type: EventType, server_path: &str, delivered: &WatchedEvent) {
        let kinds = affected_kinds(event_type);
        let mut fired = Vec::new();
        {
            let mut inner = self.inner.lock().expect("watch registry poisoned");
            let mut i = 0;
            while i < inner.len() {
                if kinds.contains(&inner[i].kind) && inner[i].path == server_path {
                    fired.push(inner.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for key in fired {
            for waiter in key.waiters {
                let _ = waiter.try_send(delivered.clone());
            }
        }
    }

    /// Snapshot of armed keys for `SetWatches`, split by kind, in original
    /// registration order. `None` when nothing is armed.
    pub fn set_watches(&self) -> Option<SetWatchesLists> {
        let inner = self.inner.lock().expect("watch registry poisoned");
        if inner.is_empty() {
            return None;
        }
        let mut lists = SetWatchesLists::default();
        for key in inner.iter() {
            match key.kind {
                WatchKind::Data => lists.data.push(key.path.clone()),
                WatchKind::Exists => lists.exists.push(key.path.clone()),
                WatchKind::Child => lists.child.push(key.path.clone()),
            }
        }
        Some(lists)
    }

    /// Signals every waiter with the synthetic expiration event and empties
    /// the registry.
    pub fn expire(&self) {
        let drained: Vec<ArmedKey> = {
            let mut inner = self.inner.lock().expect("watch registry poisoned");
            inner.drain(..).collect()
        };
        let event = WatchedEvent {
            event_type: EventType::None,
            state: KeeperState::Expired,
            path: String::new(),
        };
        for key in drained {
            for waiter in key.waiters {
                let _ = waiter.try_send(event.clone());
            }
        }
    }

    /// Silent release, for caller-requested shutdown.
    pub fn clear(&self) {
        self.inner.lock().expect("watch registry poisoned").clear();
    }

    pub fn armed_len(&self) -> usize {
        self.inner.lock().expect("watch registry poisoned").len()
    }
}

fn affected_kinds(event_type: EventType) -> &'static [WatchKind] {
    match event_type {
        EventType::NodeCreated => &[WatchKind::Exists],
        EventType::NodeDeleted => &[WatchKind::Exists, WatchKind::Data, WatchKind::Child],
        EventType::NodeDataChanged => &[WatchKind::Exists, WatchKind::Data],
        EventType::NodeChildrenChanged => &[WatchKind::Child],
        EventType::None => &[],
    }
}
