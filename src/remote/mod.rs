//! Remote peers and the notice layer.
//!
//! A remote is the local stand-in for a peer instance: it owns the mirror
//! histories tracking that peer (its remote FOL and remote slot) and
//! converts local state changes into one-way notices. Two back-ends
//! exist: an RPC transport for real peers and a direct in-process loop
//! used by tests and single-node setups.
//!
//! Delivery is one-way and best-effort, FIFO per connection. Lost
//! durability notices are recovered by replaying the mirror history on
//! reconnect.

pub mod wire;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use auto_impl::auto_impl;
use once_cell::sync::OnceCell;

use crate::dtm::Dtm;
use crate::errors::{DtmError, Result};
use crate::history::{History, HistoryFlags};
use crate::htype::{self, HistoryKind, HTYPE_FOL_REM, HTYPE_SLOT_REM};
use crate::oper::Op;
use crate::types::{InstanceId, UpState, Version};
use wire::{Notice, NoticeOpcode, OpDescr, Wire};

/// Deadline attached to a re-posted item so the transport has a chance to
/// coalesce it into a better batch.
pub const RESEND_DEADLINE: Duration = Duration::from_millis(10);

/// Transmission record of one update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommState {
    #[default]
    Idle,
    Posted,
    Cancelled,
    Reposted,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Comm {
    pub state: CommState,
    pub deadline: Option<Duration>,
}

/// What became of a posted item: queued with the transport, or handed to
/// the receiving instance on the spot (in-process back-end).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Posted,
    Delivered,
}

/// One-way item handed to the transport.
#[derive(Clone, Debug)]
pub enum WireItem {
    /// A packed control notice.
    Notice(Vec<u8>),
    /// An operation request: packed descriptor plus the opaque body.
    Request {
        descr: Vec<u8>,
        payload: Vec<u8>,
        /// Set on re-posts; the transport may delay up to this long to
        /// coalesce. At most one of the original and the re-post is
        /// observed by the receiver.
        deadline: Option<Duration>,
    },
}

/// The transport seam. FIFO per connection, no delivery guarantee.
#[auto_impl(&, Arc)]
pub trait Transport: Send + Sync {
    fn post(&self, item: WireItem) -> Result<()>;
    fn is_active(&self) -> bool;
}

pub enum RemoteBackend {
    Rpc(Arc<dyn Transport>),
    Local(Weak<Dtm>),
}

/// A logical peer of the local instance.
pub struct Remote {
    /// Identity of this remote within the local remote set.
    id: InstanceId,
    /// The peer instance this remote stands for.
    target: InstanceId,
    /// Incarnation of the peer; bumped when it reconnects.
    epoch: AtomicU64,
    /// Set when the availability layer declares the peer gone for good.
    dead: AtomicBool,
    backend: RemoteBackend,
    local: Weak<Dtm>,
    rfol: OnceCell<Arc<History>>,
    rslot: OnceCell<Arc<History>>,
}

impl Remote {
    /// Creates a remote for `target` and registers its mirror histories
    /// with the local instance.
    pub fn new(
        local: &Arc<Dtm>,
        id: InstanceId,
        target: InstanceId,
        backend: RemoteBackend,
    ) -> Result<Arc<Remote>> {
        if target == local.id() {
            return Err(DtmError::Internal("remote cannot point at the local instance"));
        }
        let rem = Arc::new(Remote {
            id,
            target,
            epoch: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            backend,
            local: Arc::downgrade(local),
            rfol: OnceCell::new(),
            rslot: OnceCell::new(),
        });
        let rfol = History::new(
            HistoryKind::RemoteFol,
            target,
            HistoryFlags {
                owned: false,
                eager: true,
            },
        );
        rfol.set_rem(&rem);
        local.catalogue_add(HTYPE_FOL_REM, rfol.clone())?;
        rem.rfol.set(rfol).unwrap();

        let rslot = History::new(
            HistoryKind::RemoteSlot,
            target,
            HistoryFlags::default(),
        );
        rslot.set_rem(&rem);
        local.catalogue_add(HTYPE_SLOT_REM, rslot.clone())?;
        rem.rslot.set(rslot).unwrap();
        Ok(rem)
    }

    /// In-process back-end: notices and requests short-circuit into the
    /// target instance.
    pub fn new_local(
        local: &Arc<Dtm>,
        id: InstanceId,
        target: &Arc<Dtm>,
    ) -> Result<Arc<Remote>> {
        Remote::new(
            local,
            id,
            target.id(),
            RemoteBackend::Local(Arc::downgrade(target)),
        )
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn target(&self) -> InstanceId {
        self.target
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The mirror of the peer's FOL.
    pub fn rfol(&self) -> Arc<History> {
        self.rfol.get().unwrap().clone()
    }

    /// The mirror of the peer's slot.
    pub fn rslot(&self) -> Arc<History> {
        self.rslot.get().unwrap().clone()
    }

    /// Unregisters the mirror histories. Called when the peer leaves the
    /// remote set for good.
    pub fn detach(&self) {
        if let Some(local) = self.local.upgrade() {
            local.catalogue_del(HTYPE_FOL_REM, &self.target);
            local.catalogue_del(HTYPE_SLOT_REM, &self.target);
        }
    }

    pub fn is_connected(&self) -> bool {
        if self.is_dead() {
            return false;
        }
        match &self.backend {
            RemoteBackend::Rpc(transport) => transport.is_active(),
            RemoteBackend::Local(dtm) => dtm.strong_count() > 0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    /// Declares the peer dead. Every later transmission fails fast.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }

    fn post(&self, item: WireItem) -> Result<SendOutcome> {
        if self.is_dead() {
            return Err(DtmError::PeerDead(self.target));
        }
        match &self.backend {
            RemoteBackend::Rpc(transport) => {
                transport.post(item)?;
                Ok(SendOutcome::Posted)
            }
            RemoteBackend::Local(dtm) => {
                let target = dtm
                    .upgrade()
                    .ok_or(DtmError::Transient(self.target))?;
                match item {
                    WireItem::Notice(buf) => {
                        if let Err(err) = target.deliver(&buf) {
                            if !err.is_recoverable() {
                                return Err(err);
                            }
                            warn!(peer = %self.target, %err, "notice dropped by receiver");
                        }
                    }
                    WireItem::Request { descr, payload, .. } => {
                        if let Err(err) = target.deliver_request(&descr, &payload) {
                            if !err.is_recoverable() {
                                return Err(err);
                            }
                            warn!(peer = %self.target, %err, "request dropped by receiver");
                        }
                    }
                }
                Ok(SendOutcome::Delivered)
            }
        }
    }

    fn notify(
        &self,
        history: &Arc<History>,
        ver: Version,
        opcode: NoticeOpcode,
        op: Option<OpDescr>,
        is_last: bool,
    ) -> Result<()> {
        let notice = Notice {
            id: history.wire_addr(),
            ver,
            opcode,
            op,
            is_last,
        };
        self.post(WireItem::Notice(notice.pack()))?;
        Ok(())
    }

    /// Tells the peer how far this history is durable.
    pub fn persistent(&self, history: &Arc<History>) -> Result<()> {
        self.notify(
            history,
            history.persistent_cursor(),
            NoticeOpcode::Persistent,
            None,
            false,
        )
    }

    /// Durability notice for one operation, descriptor attached so the
    /// peer can advance its replica.
    pub(crate) fn notify_persistent(
        &self,
        history: &Arc<History>,
        ver: Version,
        op: Option<OpDescr>,
    ) -> Result<()> {
        self.notify(history, ver, NoticeOpcode::Persistent, op, false)
    }

    /// Tells the peer the history is sealed.
    pub fn fixed(&self, history: &Arc<History>) -> Result<()> {
        self.notify(history, 0, NoticeOpcode::Fixed, None, false)
    }

    /// Tells the peer to rewind its mirror to our high version.
    pub fn reset(&self, history: &Arc<History>) -> Result<()> {
        self.notify(history, history.high_ver(), NoticeOpcode::Reset, None, false)
    }

    /// Asks the peer to roll its mirror back to `upto`.
    pub fn undo(&self, history: &Arc<History>, upto: Version) -> Result<()> {
        self.notify(history, upto, NoticeOpcode::Undo, None, false)
    }

    /// First transmission of an operation to this peer.
    pub(crate) fn send(&self, descr: &OpDescr, payload: Vec<u8>) -> Result<SendOutcome> {
        self.post(WireItem::Request {
            descr: descr.pack(),
            payload,
            deadline: None,
        })
    }

    /// Retransmission; carries the coalescing deadline.
    pub(crate) fn resend(&self, descr: &OpDescr, payload: Vec<u8>) -> Result<SendOutcome> {
        self.post(WireItem::Request {
            descr: descr.pack(),
            payload,
            deadline: Some(RESEND_DEADLINE),
        })
    }

    /// Replays one operation during recovery.
    pub fn redo_send(
        &self,
        history: &Arc<History>,
        op: &Arc<Op>,
        is_last: bool,
    ) -> Result<()> {
        let ver = op.ver_on(history).unwrap_or(0);
        self.notify(history, ver, NoticeOpcode::Redo, Some(op.descr()), is_last)
    }

    /// Walks the peer's mirror FOL from the earliest update and replays
    /// every operation that was in flight, in version order. The last
    /// replay is flagged so the peer may batch-commit. Returns the number
    /// of operations replayed.
    pub fn redo_all(&self) -> Result<usize> {
        let rfol = self.rfol();
        let ops: Vec<Arc<Op>> = {
            let inner = rfol.lock();
            let mut ops: Vec<Arc<Op>> = Vec::new();
            for up in inner.ups() {
                if up.state < UpState::InProgress || htype::is_stable(&rfol, up) {
                    continue;
                }
                if let Some(op) = up.op.upgrade() {
                    if !ops.iter().any(|known| Arc::ptr_eq(known, &op)) {
                        ops.push(op);
                    }
                }
            }
            ops
        };
        let count = ops.len();
        for (i, op) in ops.iter().enumerate() {
            self.redo_send(&rfol, op, i + 1 == count)?;
        }
        debug!(peer = %self.target, count, "replay finished");
        Ok(count)
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish()
    }
}
